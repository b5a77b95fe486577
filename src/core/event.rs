//! 任务事件日志与目标结局监听
//!
//! 每条观测、请求、撤回都以 `"<tick> <TYPE> <object> <predicate>"` 一行记录，便于事后分析。

use std::fmt;
use std::io::Write;

use serde::Serialize;

use crate::plan::Tick;
use crate::reactor::GoalRequest;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Notify,
    Request,
    Recall,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Notify => "NOTIFY",
            EventKind::Request => "REQUEST",
            EventKind::Recall => "RECALL",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MissionEvent {
    pub tick: Tick,
    pub kind: EventKind,
    pub object: String,
    pub predicate: String,
}

impl fmt::Display for MissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.tick, self.kind, self.object, self.predicate)
    }
}

/// 事件日志：内存保留全部事件，可选写入文件
pub struct EventLog {
    enabled: bool,
    events: Vec<MissionEvent>,
    sink: Option<Box<dyn Write + Send>>,
}

impl EventLog {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: Vec::new(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, tick: Tick, kind: EventKind, object: &str, predicate: &str) {
        if !self.enabled {
            return;
        }
        let event = MissionEvent {
            tick,
            kind,
            object: object.to_string(),
            predicate: predicate.to_string(),
        };
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = writeln!(sink, "{}", event) {
                tracing::warn!("event log write failed, disabling file output: {}", e);
                self.sink = None;
            }
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[MissionEvent] {
        &self.events
    }

    pub fn flush(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.flush();
        }
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(true)
    }
}

/// 目标结局监听：被拒绝或已完成时回调
pub trait AgentListener: Send {
    fn notify_rejected(&mut self, _reactor: &str, _goal: &GoalRequest) {}

    fn notify_completed(&mut self, _reactor: &str, _goal: &GoalRequest) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_event_line_format() {
        let buf = SharedBuf::default();
        let mut log = EventLog::new(true).with_sink(Box::new(buf.clone()));
        log.record(3, EventKind::Notify, "light", "Holds");
        log.record(4, EventKind::Request, "path", "At");
        log.flush();

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "3 NOTIFY light Holds\n4 REQUEST path At\n");
        assert_eq!(log.events().len(), 2);
    }

    #[test]
    fn test_disabled_log_records_nothing() {
        let mut log = EventLog::new(false);
        log.record(0, EventKind::Recall, "path", "At");
        assert!(log.events().is_empty());
    }
}
