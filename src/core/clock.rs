//! 时钟：产生当前 tick
//!
//! - [`PseudoClock`]：每 N 次调用推进一个 tick，确定性、单线程，测试用
//! - [`RealTimeClock`]：后台线程按墙钟推进；调用方落后时一次补齐所有已过去的周期
//!
//! 两者都可在每次推进时采样进程资源占用；采样出错只会降级为"不可用"，不会中止时钟。

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::plan::Tick;

/// 伪时钟步数为 0 时的替代值
const DEFAULT_STEPS_PER_TICK: u32 = 50;

pub trait Clock: Send {
    /// 开始计时（实时时钟在此启动后台线程）
    fn start(&mut self) {}

    /// 当前 tick；非阻塞、单调不减
    fn get_next_tick(&mut self) -> Tick;

    /// 等待一小段时间（实时时钟等到下一个 tick 边界）
    fn sleep(&self);

    fn stats(&self) -> ClockStats;
}

/// 进程资源占用（秒 / KB）
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResourceUsage {
    pub user_secs: f64,
    pub system_secs: f64,
    pub max_rss_kb: i64,
}

impl ResourceUsage {
    fn since(&self, earlier: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            user_secs: self.user_secs - earlier.user_secs,
            system_secs: self.system_secs - earlier.system_secs,
            max_rss_kb: self.max_rss_kb,
        }
    }
}

/// 上一 tick 与累计的资源占用；None 表示不可用
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ClockStats {
    pub last_tick: Option<ResourceUsage>,
    pub total: Option<ResourceUsage>,
}

impl ClockStats {
    pub fn is_available(&self) -> bool {
        self.total.is_some()
    }
}

#[derive(Debug)]
struct ResourceSampler {
    enabled: bool,
    stats: ClockStats,
}

impl ResourceSampler {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stats: ClockStats::default(),
        }
    }

    fn sample(&mut self) {
        if !self.enabled {
            return;
        }
        match current_usage() {
            Ok(now) => {
                self.stats.last_tick = Some(match self.stats.total {
                    Some(prev) => now.since(&prev),
                    None => now,
                });
                self.stats.total = Some(now);
            }
            Err(e) => {
                tracing::warn!("resource sampling failed ({}), disabling process statistics", e);
                self.enabled = false;
                self.stats = ClockStats::default();
            }
        }
    }
}

#[cfg(unix)]
fn current_usage() -> io::Result<ResourceUsage> {
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let secs = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1e6;
    Ok(ResourceUsage {
        user_secs: secs(ru.ru_utime),
        system_secs: secs(ru.ru_stime),
        max_rss_kb: ru.ru_maxrss as i64,
    })
}

#[cfg(not(unix))]
fn current_usage() -> io::Result<ResourceUsage> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process statistics not supported on this platform",
    ))
}

/// 步进时钟：第 N、2N、3N... 次调用时推进
#[derive(Debug)]
pub struct PseudoClock {
    tick: Tick,
    internal: u64,
    steps_per_tick: u32,
    sleep_seconds: f64,
    sampler: ResourceSampler,
}

impl PseudoClock {
    pub fn new(sleep_seconds: f64, steps_per_tick: u32, stats: bool) -> Self {
        let steps_per_tick = if steps_per_tick == 0 {
            tracing::warn!(
                "steps_per_tick must be positive, using {}",
                DEFAULT_STEPS_PER_TICK
            );
            DEFAULT_STEPS_PER_TICK
        } else {
            steps_per_tick
        };
        Self {
            tick: 0,
            internal: 0,
            steps_per_tick,
            sleep_seconds: sleep_seconds.max(0.0),
            sampler: ResourceSampler::new(stats),
        }
    }

    pub fn steps_per_tick(&self) -> u32 {
        self.steps_per_tick
    }
}

impl Clock for PseudoClock {
    fn get_next_tick(&mut self) -> Tick {
        if self.internal > 0 && self.internal % self.steps_per_tick as u64 == 0 {
            self.tick += 1;
            self.sampler.sample();
        }
        self.internal += 1;
        self.tick
    }

    fn sleep(&self) {
        if self.sleep_seconds > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(self.sleep_seconds));
        }
    }

    fn stats(&self) -> ClockStats {
        self.sampler.stats
    }
}

#[derive(Debug)]
struct RealTimeState {
    tick: Tick,
    next_tick_date: Instant,
    stopped: bool,
    sampler: ResourceSampler,
}

/// 实时时钟：后台线程与调度线程只共享 (tick, 下一 tick 时刻) 这一份状态
pub struct RealTimeClock {
    period: Duration,
    shared: Arc<(Mutex<RealTimeState>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl RealTimeClock {
    pub fn new(seconds_per_tick: f64, stats: bool) -> Self {
        let period = Duration::from_secs_f64(seconds_per_tick.max(0.001));
        Self {
            period,
            shared: Arc::new((
                Mutex::new(RealTimeState {
                    tick: 0,
                    next_tick_date: Instant::now() + period,
                    stopped: false,
                    sampler: ResourceSampler::new(stats),
                }),
                Condvar::new(),
            )),
            thread: None,
        }
    }

    fn run(period: Duration, shared: Arc<(Mutex<RealTimeState>, Condvar)>) {
        let (lock, cvar) = &*shared;
        let Ok(mut state) = lock.lock() else {
            return;
        };
        loop {
            if state.stopped {
                return;
            }
            let now = Instant::now();
            if now < state.next_tick_date {
                let wait = state.next_tick_date - now;
                state = match cvar.wait_timeout(state, wait) {
                    Ok((s, _)) => s,
                    Err(_) => return,
                };
                continue;
            }
            // 落后时按已过去的周期数一次补齐
            let (periods, advance) = catch_up(now.duration_since(state.next_tick_date), period);
            state.tick = state.tick.saturating_add(periods);
            state.next_tick_date = state
                .next_tick_date
                .checked_add(advance)
                .unwrap_or(now + period);
            state.sampler.sample();
        }
    }
}

/// 落后 `behind` 时应推进的周期数，以及下一 tick 时刻的推移量
fn catch_up(behind: Duration, period: Duration) -> (u64, Duration) {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    let period_ns = period.as_nanos().max(1);
    let periods = 1 + behind.as_nanos() / period_ns;
    let advance_ns = periods.saturating_mul(period_ns);
    let secs = u64::try_from(advance_ns / NANOS_PER_SEC).unwrap_or(u64::MAX);
    let advance = Duration::new(secs, (advance_ns % NANOS_PER_SEC) as u32);
    (u64::try_from(periods).unwrap_or(u64::MAX), advance)
}

impl Clock for RealTimeClock {
    fn start(&mut self) {
        if self.thread.is_some() {
            return;
        }
        if let Ok(mut state) = self.shared.0.lock() {
            state.next_tick_date = Instant::now() + self.period;
        }
        let shared = Arc::clone(&self.shared);
        let period = self.period;
        self.thread = Some(std::thread::spawn(move || Self::run(period, shared)));
    }

    fn get_next_tick(&mut self) -> Tick {
        self.shared
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tick
    }

    fn sleep(&self) {
        let delay = match self.shared.0.lock() {
            Ok(s) if self.thread.is_some() => s.next_tick_date.saturating_duration_since(Instant::now()),
            _ => self.period / 1000,
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    fn stats(&self) -> ClockStats {
        self.shared
            .0
            .lock()
            .map(|s| s.sampler.stats)
            .unwrap_or_default()
    }
}

impl Drop for RealTimeClock {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.shared;
        if let Ok(mut state) = lock.lock() {
            state.stopped = true;
        }
        cvar.notify_all();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pseudo_clock_advances_every_n_calls() {
        let mut clock = PseudoClock::new(0.0, 3, false);
        let ticks: Vec<Tick> = (0..10).map(|_| clock.get_next_tick()).collect();
        assert_eq!(ticks, vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3]);
    }

    #[test]
    fn test_pseudo_clock_zero_steps_falls_back() {
        let clock = PseudoClock::new(0.0, 0, false);
        assert_eq!(clock.steps_per_tick(), DEFAULT_STEPS_PER_TICK);
    }

    #[test]
    fn test_stats_unavailable_when_disabled() {
        let mut clock = PseudoClock::new(0.0, 1, false);
        clock.get_next_tick();
        clock.get_next_tick();
        assert!(!clock.stats().is_available());
    }

    #[cfg(unix)]
    #[test]
    fn test_stats_sampled_on_advance() {
        let mut clock = PseudoClock::new(0.0, 1, true);
        clock.get_next_tick();
        clock.get_next_tick();
        assert!(clock.stats().is_available());
    }

    #[test]
    fn test_catch_up_counts_every_elapsed_period() {
        let period = Duration::from_millis(10);
        assert_eq!(catch_up(Duration::ZERO, period), (1, period));
        assert_eq!(catch_up(Duration::from_millis(25), period), (3, Duration::from_millis(30)));

        // 周期数超过 u32 时不截断
        let (periods, advance) = catch_up(Duration::from_secs(10), Duration::from_nanos(1));
        assert_eq!(periods, 10_000_000_001);
        assert_eq!(advance, Duration::new(10, 1));
    }

    #[test]
    fn test_poisoned_state_keeps_last_tick() {
        let mut clock = RealTimeClock::new(0.01, false);
        clock.shared.0.lock().unwrap().tick = 7;

        let shared = Arc::clone(&clock.shared);
        let result = std::thread::spawn(move || {
            let _guard = shared.0.lock().unwrap();
            panic!("poison the clock state");
        })
        .join();
        assert!(result.is_err());
        assert!(clock.shared.0.is_poisoned());
        assert_eq!(clock.get_next_tick(), 7);
    }

    #[test]
    fn test_real_time_clock_catches_up() {
        let mut clock = RealTimeClock::new(0.01, false);
        assert_eq!(clock.get_next_tick(), 0);
        clock.start();
        std::thread::sleep(Duration::from_millis(80));
        let tick = clock.get_next_tick();
        assert!(tick >= 3, "tick was {}", tick);

        let mut last = tick;
        for _ in 0..5 {
            clock.sleep();
            let t = clock.get_next_tick();
            assert!(t >= last);
            last = t;
        }
    }
}
