//! 任务级集成测试：多个反应器经 Agent 协同运行

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::{Arc, Mutex};

    use teleo::config::{AppConfig, ReactorConfig, ScriptedObservation, TimelineConfig, TokenConfig};
    use teleo::core::{
        Agent, AgentBuilder, AgentListener, EventKind, KernelError, PseudoClock, ReactorContext,
    };
    use teleo::deliberative::{CoreState, DbCore};
    use teleo::plan::{Domain, Interval, Rule, Tick};
    use teleo::reactor::{
        Adapter, GoalRequest, Observation, Reactor, ReactorBase, ReactorRegistry, TimelineModes,
    };

    #[derive(Clone, Default)]
    struct Fates(Arc<Mutex<Vec<String>>>);

    impl Fates {
        fn all(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl AgentListener for Fates {
        fn notify_rejected(&mut self, reactor: &str, goal: &GoalRequest) {
            self.0
                .lock()
                .unwrap()
                .push(format!("rejected {} {}", reactor, goal.predicate));
        }

        fn notify_completed(&mut self, reactor: &str, goal: &GoalRequest) {
            self.0
                .lock()
                .unwrap()
                .push(format!("completed {} {}", reactor, goal.predicate));
        }
    }

    fn app(final_tick: Tick, reactors: Vec<ReactorConfig>) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.agent.name = "mission".into();
        cfg.agent.final_tick = final_tick;
        cfg.reactors = reactors;
        cfg
    }

    fn builder(final_tick: Tick, reactors: Vec<ReactorConfig>) -> AgentBuilder {
        AgentBuilder::new(app(final_tick, reactors))
            .in_memory()
            .with_clock(Box::new(PseudoClock::new(0.0, 50, false)))
    }

    fn mission(final_tick: Tick, reactors: Vec<ReactorConfig>) -> Agent {
        builder(final_tick, reactors).build().unwrap()
    }

    fn db_core<'a>(agent: &'a Agent, name: &str) -> &'a DbCore {
        agent
            .reactor(name)
            .and_then(|r| r.as_any().downcast_ref::<DbCore>())
            .unwrap()
    }

    fn scripted(tick: Tick, timeline: &str, predicate: &str) -> ScriptedObservation {
        ScriptedObservation {
            tick,
            timeline: timeline.into(),
            predicate: predicate.into(),
            params: Default::default(),
        }
    }

    #[test]
    fn test_observer_sees_value_in_the_same_tick() {
        let a = ReactorConfig::new("A", "DbCore")
            .with_timeline(TimelineConfig::internal("light"))
            .with_fact(TokenConfig::new("light", "Holds").with_param("value", Domain::symbol("on")));
        let b = ReactorConfig::new("B", "DbCore").with_timeline(TimelineConfig::external("light"));
        let mut agent = mission(5, vec![b, a]);
        assert_eq!(agent.sorted_reactors(), vec!["A", "B"]);
        assert_eq!(agent.owner("light"), Some("A"));

        assert!(agent.do_next().unwrap());
        let first = &agent.event_log().events()[0];
        assert_eq!((first.tick, first.kind), (0, EventKind::Notify));
        assert_eq!((first.object.as_str(), first.predicate.as_str()), ("light", "Holds"));

        let b = db_core(&agent, "B");
        let key = b.db().value_at("light", 0).unwrap();
        let token = b.db().token(key).unwrap();
        assert_eq!(token.param("value"), Some(&Domain::symbol("on")));
        assert_eq!(token.start().last, Interval::singleton(0));

        // 惯性假设：之后的 tick 不再发布，B 延续同一取值
        assert!(agent.do_next().unwrap());
        assert!(agent.do_next().unwrap());
        let b = db_core(&agent, "B");
        assert_eq!(b.state(), CoreState::Inactive);
        assert_eq!(b.db().value_at("light", 2), Some(key));
        assert_eq!(agent.event_log().events().len(), 1);
    }

    #[test]
    fn test_timed_out_goal_is_rejected_before_planning() {
        let planner = ReactorConfig::new("planner", "DbCore")
            .with_timeline(TimelineConfig::internal("camera"))
            .with_goal(TokenConfig::new("camera", "Shoot").with_start(0, 2));
        let fates = Fates::default();
        let mut agent = builder(6, vec![planner])
            .with_listener(Box::new(fates.clone()))
            .build()
            .unwrap();

        for _ in 0..3 {
            assert!(agent.do_next().unwrap());
        }
        assert_eq!(db_core(&agent, "planner").goals().len(), 1);
        assert!(fates.all().is_empty());

        assert!(agent.do_next().unwrap());
        let planner = db_core(&agent, "planner");
        assert!(planner.goals().is_empty());
        assert_eq!(planner.solver().step_count(), 0);
        assert_eq!(fates.all(), vec!["rejected planner Shoot"]);
    }

    #[test]
    fn test_missing_observation_invalidates_then_repairs() {
        let world = ReactorConfig::new("world", "Adapter")
            .with_timeline(TimelineConfig::internal("light"))
            .with_observation(scripted(0, "light", "Holds"));
        let watcher = ReactorConfig::new("watcher", "DbCore")
            .with_timeline(TimelineConfig::external("light"))
            .with_rule(Rule {
                timeline: "light".into(),
                predicate: "Holds".into(),
                duration: Some((1, 3)),
                slaves: vec![],
            });
        let mut agent = mission(10, vec![world, watcher]);

        for _ in 0..3 {
            assert!(agent.do_next().unwrap());
            assert_eq!(db_core(&agent, "watcher").invalid_reason(), None);
        }

        assert!(agent.do_next().unwrap());
        let watcher = db_core(&agent, "watcher");
        let reason = watcher.invalid_reason().unwrap();
        assert!(reason.starts_with("Expected an observation for light"), "{}", reason);
        assert_eq!(watcher.state(), CoreState::Inactive);
    }

    #[test]
    fn test_dispatch_happens_when_window_reaches_start() {
        let world = ReactorConfig::new("world", "Adapter")
            .with_timeline(TimelineConfig::internal("camera"))
            .with_observation(scripted(0, "camera", "Idle"));
        let planner = ReactorConfig::new("planner", "DbCore")
            .with_lookahead(5)
            .with_timeline(TimelineConfig::external("camera"))
            .with_goal(TokenConfig::new("camera", "Shoot").with_start(3, 5));
        let fates = Fates::default();
        let mut agent = builder(8, vec![world, planner])
            .with_listener(Box::new(fates.clone()))
            .build()
            .unwrap();

        assert!(agent.do_next().unwrap());
        assert_eq!(db_core(&agent, "planner").last_complete_tick(), Some(0));
        for _ in 1..5 {
            assert!(agent.do_next().unwrap());
        }

        let requests: Vec<_> = agent
            .event_log()
            .events()
            .iter()
            .filter(|e| e.kind == EventKind::Request)
            .map(|e| (e.tick, e.object.clone(), e.predicate.clone()))
            .collect();
        assert_eq!(requests, vec![(3, "camera".to_string(), "Shoot".to_string())]);

        let adapter = agent
            .reactor("world")
            .and_then(|r| r.as_any().downcast_ref::<Adapter>())
            .unwrap();
        let shots: Vec<Tick> = adapter
            .published()
            .iter()
            .filter(|(_, obs)| obs.predicate == "Shoot")
            .map(|(t, _)| *t)
            .collect();
        assert_eq!(shots, vec![3]);
        assert_eq!(db_core(&agent, "planner").state(), CoreState::Inactive);

        agent.run().unwrap();
        assert_eq!(fates.all(), vec!["completed planner Shoot"]);
    }

    #[test]
    fn test_every_tick_advances_by_one() {
        let a = ReactorConfig::new("A", "DbCore").with_timeline(TimelineConfig::internal("light").with_default("Off"));
        let mut agent = mission(4, vec![a]);
        for t in 0..4 {
            assert_eq!(agent.current_tick(), t);
            assert!(agent.do_next().unwrap());
            assert_eq!(agent.current_tick(), t + 1);
        }
        assert!(agent.is_mission_complete());
        assert!(!agent.do_next().unwrap());
        assert_eq!(agent.monitor().ticks().len(), 4);
    }

    #[test]
    fn test_terminate_stops_the_loop() {
        let a = ReactorConfig::new("A", "DbCore").with_timeline(TimelineConfig::internal("light"));
        let mut agent = mission(10, vec![a]);
        assert!(agent.do_next().unwrap());
        agent.terminate();
        agent.terminate();
        assert!(!agent.do_next().unwrap());
        assert_eq!(agent.current_tick(), 1);
    }

    #[test]
    fn test_duplicate_server_is_rejected() {
        let a = ReactorConfig::new("A", "Adapter").with_timeline(TimelineConfig::internal("light"));
        let b = ReactorConfig::new("B", "Adapter").with_timeline(TimelineConfig::internal("light"));
        let err = builder(5, vec![a, b]).build().err().unwrap();
        assert!(matches!(
            err,
            KernelError::DuplicateServer { ref timeline, ref server, ref claimant }
                if timeline == "light" && server == "A" && claimant == "B"
        ));
    }

    #[test]
    fn test_allocation_errors() {
        let dup = vec![
            ReactorConfig::new("A", "Observer"),
            ReactorConfig::new("A", "Observer"),
        ];
        assert!(matches!(builder(5, dup).build(), Err(KernelError::DuplicateReactor(_))));

        let orphan = vec![ReactorConfig::new("B", "Observer").with_timeline(TimelineConfig::external("door"))];
        assert!(matches!(
            builder(5, orphan).build(),
            Err(KernelError::MissingServer { .. })
        ));

        let cycle = vec![
            ReactorConfig::new("A", "DbCore")
                .with_timeline(TimelineConfig::internal("a"))
                .with_timeline(TimelineConfig::external("b")),
            ReactorConfig::new("B", "DbCore")
                .with_timeline(TimelineConfig::internal("b"))
                .with_timeline(TimelineConfig::external("a")),
        ];
        assert!(matches!(builder(5, cycle).build(), Err(KernelError::CyclicDependency(_))));
    }

    /// 同时声明服务与订阅同一时间线的自定义组件
    struct Echo {
        base: ReactorBase,
    }

    impl Reactor for Echo {
        fn base(&self) -> &ReactorBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ReactorBase {
            &mut self.base
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }

        fn query_timeline_modes(&self) -> TimelineModes {
            TimelineModes {
                externals: vec!["echo".into()],
                internals: vec!["echo".into()],
            }
        }

        fn synchronize(&mut self, _ctx: &mut ReactorContext<'_>) -> bool {
            true
        }
    }

    #[test]
    fn test_custom_component_cannot_observe_itself() {
        let mut registry = ReactorRegistry::new();
        registry.register("Echo", |cfg| {
            Ok(Box::new(Echo {
                base: ReactorBase::new(cfg.name.clone(), 0, 0),
            }))
        });
        let err = builder(5, vec![ReactorConfig::new("E", "Echo")])
            .with_registry(registry)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, KernelError::SelfDependency { .. }));
    }

    type Received = Arc<Mutex<Vec<(Tick, String)>>>;

    /// 服务 `arm` 的组件：tick 0 发布 Idle，记录收到的请求，拒绝指定谓词
    struct Arm {
        base: ReactorBase,
        refuse: Option<String>,
        received: Received,
    }

    impl Reactor for Arm {
        fn base(&self) -> &ReactorBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ReactorBase {
            &mut self.base
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }

        fn query_timeline_modes(&self) -> TimelineModes {
            TimelineModes {
                externals: vec![],
                internals: vec!["arm".into()],
            }
        }

        fn synchronize(&mut self, ctx: &mut ReactorContext<'_>) -> bool {
            if ctx.current_tick() == 0 {
                ctx.notify(&Observation::new("arm", "Idle"));
            }
            true
        }

        fn handle_request(&mut self, goal: &GoalRequest, ctx: &mut ReactorContext<'_>) -> bool {
            self.received
                .lock()
                .unwrap()
                .push((ctx.current_tick(), goal.predicate.clone()));
            self.refuse.as_deref() != Some(goal.predicate.as_str())
        }
    }

    fn arm_registry(refuse: Option<&str>, received: &Received) -> ReactorRegistry {
        let refuse = refuse.map(str::to_string);
        let received = Arc::clone(received);
        let mut registry = ReactorRegistry::new();
        registry.register("Arm", move |cfg| {
            Ok(Box::new(Arm {
                base: ReactorBase::new(cfg.name.clone(), cfg.lookahead, cfg.latency),
                refuse: refuse.clone(),
                received: Arc::clone(&received),
            }))
        });
        registry
    }

    #[test]
    fn test_rejected_request_blocks_later_tokens() {
        let received = Received::default();
        let arm = ReactorConfig::new("arm", "Arm").with_lookahead(10);
        let planner = ReactorConfig::new("planner", "DbCore")
            .with_lookahead(5)
            .with_timeline(TimelineConfig::external("arm"))
            .with_goal(TokenConfig::new("arm", "First").with_start(1, 2))
            .with_goal(TokenConfig::new("arm", "Second").with_start(4, 5));
        let mut agent = builder(12, vec![arm, planner])
            .with_registry(arm_registry(Some("First"), &received))
            .build()
            .unwrap();

        assert!(agent.do_next().unwrap());
        assert_eq!(db_core(&agent, "planner").last_complete_tick(), Some(0));
        assert!(received.lock().unwrap().is_empty());

        // 两个目标都在窗口内，但 First 被拒后本 tick 不再请求 Second
        assert!(agent.do_next().unwrap());
        assert_eq!(*received.lock().unwrap(), vec![(1, "First".to_string())]);
    }

    #[test]
    fn test_token_waits_until_window_reaches_it() {
        let received = Received::default();
        let arm = ReactorConfig::new("arm", "Arm").with_lookahead(2).with_latency(1);
        let planner = ReactorConfig::new("planner", "DbCore")
            .with_lookahead(5)
            .with_timeline(TimelineConfig::external("arm"))
            .with_goal(TokenConfig::new("arm", "Go").with_start(5, 6));
        let mut agent = builder(12, vec![arm, planner])
            .with_registry(arm_registry(None, &received))
            .build()
            .unwrap();

        // 窗口 [now+1, now+3]：tick 0、1 够不到开始时间 5
        for _ in 0..2 {
            assert!(agent.do_next().unwrap());
            assert!(received.lock().unwrap().is_empty());
        }
        assert!(agent.do_next().unwrap());
        assert!(agent.do_next().unwrap());
        assert_eq!(*received.lock().unwrap(), vec![(2, "Go".to_string())]);
    }

    #[test]
    fn test_unbounded_server_lookahead_still_dispatches() {
        let server = ReactorConfig::new("S", "DbCore")
            .with_lookahead(u64::MAX)
            .with_timeline(TimelineConfig::internal("nav").with_default("Idle"));
        let client = ReactorConfig::new("C", "DbCore")
            .with_lookahead(5)
            .with_timeline(TimelineConfig::external("nav"))
            .with_goal(TokenConfig::new("nav", "Go").with_start(1, 3));
        let mut agent = mission(10, vec![server, client]);

        assert!(agent.do_next().unwrap());
        assert!(agent.do_next().unwrap());
        let requests: Vec<_> = agent
            .event_log()
            .events()
            .iter()
            .filter(|e| e.kind == EventKind::Request)
            .map(|e| (e.tick, e.predicate.clone()))
            .collect();
        assert_eq!(requests, vec![(1, "Go".to_string())]);
    }
}
