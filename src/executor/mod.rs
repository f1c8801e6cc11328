pub mod cached;
pub mod go_run;

use std::{
    fmt::{Display, Formatter},
    process::ExitStatus,
    sync::Mutex,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    sync::mpsc,
    time::Instant,
};

pub use cached::CachedExecutor;
pub use go_run::GoExecutor;

/// Appended once the child has produced the output budget; additional to it.
pub const TRUNCATION_MARKER: &str = "\n... (output truncated)";

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug)]
pub enum ExecError {
    TempFile(std::io::Error),
    WriteSource(std::io::Error),
    Spawn(std::io::Error),
    Pipe(std::io::Error),
    Read(std::io::Error),
    Wait(std::io::Error),
    Exit(ExitStatus),
    Timeout,
    ClientGone,
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl Display for ExecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TempFile(err) => write!(f, "error creando archivo temporal: {err}"),
            Self::WriteSource(err) => write!(f, "error escribiendo código: {err}"),
            Self::Spawn(err) => write!(f, "error iniciando el comando: {err}"),
            Self::Pipe(err) => write!(f, "error obteniendo salida del comando: {err}"),
            Self::Read(err) => write!(f, "error leyendo salida: {err}"),
            Self::Wait(err) => write!(f, "error en la ejecución: {err}"),
            Self::Exit(status) => write!(f, "error en la ejecución: {status}"),
            Self::Timeout => write!(f, "error en la ejecución: tiempo límite excedido"),
            Self::ClientGone => write!(f, "conexión cerrada por el cliente"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Destination for child output. A write is the flush unit: once it returns,
/// the chunk is on its way to the client.
#[async_trait]
pub trait OutputSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> ExecResult<()>;
}

/// The one capability the gateway depends on: stream bounded output for a
/// source program until `deadline`. The caching wrapper implements the same
/// trait around the raw runner.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(
        &self,
        source: &str,
        deadline: Instant,
        sink: &mut dyn OutputSink,
    ) -> ExecResult<()>;
}

/// Sink backed by the response channel; a failed send means the client went
/// away and the execution should be cancelled.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> ExecResult<()> {
        self.tx
            .send(Bytes::copy_from_slice(chunk))
            .await
            .map_err(|_| ExecError::ClientGone)
    }
}

/// Forwards to an inner sink while keeping a copy for the result cache.
pub struct TeeSink<'a> {
    inner: &'a mut dyn OutputSink,
    captured: BytesMut,
}

impl<'a> TeeSink<'a> {
    pub fn new(inner: &'a mut dyn OutputSink) -> Self {
        Self {
            inner,
            captured: BytesMut::with_capacity(4096),
        }
    }

    pub fn into_captured(self) -> Bytes {
        self.captured.freeze()
    }
}

#[async_trait]
impl OutputSink for TeeSink<'_> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> ExecResult<()> {
        self.inner.write_chunk(chunk).await?;
        self.captured.extend_from_slice(chunk);
        Ok(())
    }
}

const MAX_POOLED_BUFFERS: usize = 32;

/// Fixed-size read buffers reused across executions.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    chunk_size: usize,
}

impl BufferPool {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            chunk_size,
        }
    }

    pub fn get(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_else(|| vec![0; self.chunk_size])
    }

    pub fn put(&self, buffer: Vec<u8>) {
        if buffer.len() != self.chunk_size {
            return;
        }
        if let Ok(mut pool) = self.buffers.lock() {
            if pool.len() < MAX_POOLED_BUFFERS {
                pool.push(buffer);
            }
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct CollectSink {
    pub data: Vec<u8>,
}

#[cfg(test)]
#[async_trait]
impl OutputSink for CollectSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> ExecResult<()> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }
}
