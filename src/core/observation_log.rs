//! 观测日志：每条发布的观测一行 JSON，可由 Adapter 回放

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::plan::Tick;
use crate::reactor::Observation;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub tick: Tick,
    #[serde(flatten)]
    pub observation: Observation,
    /// 写入时的墙钟时间（RFC 3339）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<String>,
}

pub struct ObservationLog {
    writer: BufWriter<File>,
}

impl ObservationLog {
    /// 追加模式打开，必要时创建目录
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn record(&mut self, tick: Tick, observation: &Observation) -> Result<()> {
        let record = ObservationRecord {
            tick,
            observation: observation.clone(),
            recorded_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// 读取整个日志；空行跳过
    pub fn read_all(path: &Path) -> Result<Vec<ObservationRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}
