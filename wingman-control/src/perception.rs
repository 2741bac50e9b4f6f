//! Perception sources feeding the control loop

use crate::error::{ControlError, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wingman_core::Frame;

/// A stream of frames with their detections.
///
/// `next_frame` must be cancel-safe: the control loop races it against
/// commands and the frame deadline.
#[async_trait]
pub trait PerceptionSource: Send {
    fn name(&self) -> &str;

    /// Next frame; an error means the source is gone for good
    async fn next_frame(&mut self) -> Result<Frame>;
}

#[async_trait]
impl<S: PerceptionSource + ?Sized> PerceptionSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        (**self).next_frame().await
    }
}

/// Frames handed over by an in-process pipeline
pub struct ChannelSource {
    receiver: mpsc::Receiver<Frame>,
}

impl ChannelSource {
    pub fn new(receiver: mpsc::Receiver<Frame>) -> Self {
        Self { receiver }
    }

    pub fn channel(capacity: usize) -> (mpsc::Sender<Frame>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Self::new(receiver))
    }
}

#[async_trait]
impl PerceptionSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| ControlError::PerceptionUnavailable("frame channel closed".to_string()))
    }
}

/// Newline-delimited JSON frames from any async reader
pub struct JsonLinesSource<R> {
    name: String,
    lines: Lines<R>,
    line_number: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            lines: reader.lines(),
            line_number: 0,
        }
    }
}

impl JsonLinesSource<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new("stdin", BufReader::new(tokio::io::stdin()))
    }
}

impl JsonLinesSource<BufReader<TcpStream>> {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            ControlError::PerceptionUnavailable(format!("cannot connect to {}: {}", addr, e))
        })?;
        info!("Connected to perception stream at {}", addr);
        Ok(Self::new(addr, BufReader::new(stream)))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> PerceptionSource for JsonLinesSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            let line = self.lines.next_line().await.map_err(|e| {
                ControlError::PerceptionUnavailable(format!("{}: {}", self.name, e))
            })?;
            let Some(line) = line else {
                return Err(ControlError::PerceptionUnavailable(format!(
                    "{}: end of stream",
                    self.name
                )));
            };
            self.line_number += 1;

            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Frame>(&line) {
                Ok(frame) => return Ok(frame),
                Err(e) => warn!(
                    source = %self.name,
                    line = self.line_number,
                    "Skipping malformed frame: {}",
                    e
                ),
            }
        }
    }
}
