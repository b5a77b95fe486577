//! 反应器依赖图
//!
//! 时间线 X 的服务者指向 X 的每个订阅者；按邻接表和入度表做拓扑排序，
//! 入度同为 0 时取注册序号最小者，因此无依赖关系的反应器保持注册顺序。

use std::collections::BTreeSet;

pub struct DependencyGraph {
    /// 邻接表：反应器序号 -> 依赖它的反应器
    pub adjacency: Vec<Vec<usize>>,
    /// 入度表：反应器序号 -> 它依赖的服务者数
    pub in_degree: Vec<usize>,
}

impl DependencyGraph {
    pub fn new(reactors: usize) -> Self {
        Self {
            adjacency: vec![Vec::new(); reactors],
            in_degree: vec![0; reactors],
        }
    }

    /// server 必须先于 observer 同步；重复边忽略
    pub fn add_edge(&mut self, server: usize, observer: usize) {
        if self.adjacency[server].contains(&observer) {
            return;
        }
        self.adjacency[server].push(observer);
        self.in_degree[observer] += 1;
    }

    /// 拓扑序；存在环时返回留在环上的反应器序号
    pub fn sort(&self) -> Result<Vec<usize>, Vec<usize>> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: BTreeSet<usize> = (0..in_degree.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(in_degree.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &self.adjacency[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() == in_degree.len() {
            Ok(order)
        } else {
            Err((0..in_degree.len()).filter(|&i| in_degree[i] > 0).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_reactors_keep_registration_order() {
        let graph = DependencyGraph::new(3);
        assert_eq!(graph.sort().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_servers_sorted_before_observers() {
        // 0 订阅 2 的时间线，1 订阅 0 的时间线
        let mut graph = DependencyGraph::new(3);
        graph.add_edge(2, 0);
        graph.add_edge(0, 1);
        graph.add_edge(0, 1);
        assert_eq!(graph.in_degree, vec![1, 1, 0]);
        assert_eq!(graph.sort().unwrap(), vec![2, 0, 1]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = DependencyGraph::new(3);
        graph.add_edge(0, 1);
        graph.add_edge(1, 0);
        assert_eq!(graph.sort().unwrap_err(), vec![0, 1]);
    }
}
