use crate::prelude::*;

use crate::unit::decoder::FrameDecoder;

use {
    async_trait::async_trait,
    bytes::BytesMut,
    futures::stream::Stream,
    std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    std::sync::Arc,
    std::time::Duration,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    tokio::sync::{Mutex, Notify},
    tokio::time::Instant,
    tokio_util::codec::Decoder,
};

pub const DEFAULT_BAUD_RATE: u32 = 115200;
const TERMINATOR: &[u8] = b"\n";
const STREAM_IDLE: Duration = Duration::from_millis(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

// Connectors {{{
/// Opens the byte stream behind a port. Called again after the link drops.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SerialIo>>;

    fn describe(&self) -> String;
}

pub struct TtyConnector {
    path: String,
    baud_rate: u32,
}

impl TtyConnector {
    pub fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_owned(),
            baud_rate,
        }
    }
}

#[async_trait]
impl Connector for TtyConnector {
    async fn connect(&self) -> Result<Box<dyn SerialIo>> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|err| anyhow!("cannot open {}: {}", self.path, err))?;

        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.path, self.baud_rate)
    }
}

/// Serial line exposed over TCP by a terminal server (`tcp://host:port`).
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn SerialIo>> {
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|err| anyhow!("cannot connect to {}: {}", self.address, err))?;
        stream.set_nodelay(true)?;

        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

pub fn connector_for(port: &str, baud_rate: u32) -> Box<dyn Connector> {
    match port.strip_prefix("tcp://") {
        Some(address) => Box::new(TcpConnector::new(address)),
        None => Box::new(TtyConnector::new(port, baud_rate)),
    }
} // }}}

// RunFlag {{{
/// Shared "keep going" flag checked at the head of every long-running loop.
#[derive(Clone, Debug)]
pub struct RunFlag(Arc<AtomicBool>);

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
} // }}}

#[derive(Debug, Clone, Copy)]
pub struct PortTimeouts {
    /// how long a writer waits for the port, and a reader for writers to finish
    pub lock: Duration,
    /// how long one framed read waits for a terminator
    pub read: Duration,
}

impl Default for PortTimeouts {
    fn default() -> Self {
        Self {
            lock: Duration::from_secs(3),
            read: Duration::from_millis(100),
        }
    }
}

struct Link {
    io: Option<Box<dyn SerialIo>>,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

/// Exclusive, framed access to one serial link.
///
/// Reads and writes share one lock. A writer announces itself before queueing
/// for the lock and readers step aside until no writer is waiting, so a
/// command is never stuck behind a stream of reads.
pub struct SerialPortChannel {
    name: String,
    connector: Box<dyn Connector>,
    timeouts: PortTimeouts,
    link: Mutex<Link>,
    pending_writes: AtomicUsize,
    writes_drained: Notify,
    frames_written: AtomicU64,
    write_failures: AtomicU64,
}

// Counts a writer as pending until it holds the port lock or gives up.
struct PendingWrite<'a>(&'a SerialPortChannel);

impl<'a> PendingWrite<'a> {
    fn new(port: &'a SerialPortChannel) -> Self {
        port.pending_writes.fetch_add(1, Ordering::SeqCst);
        Self(port)
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if self.0.pending_writes.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.writes_drained.notify_waiters();
        }
    }
}

impl SerialPortChannel {
    pub fn new(name: &str, connector: Box<dyn Connector>, timeouts: PortTimeouts) -> Self {
        Self {
            name: name.to_owned(),
            connector,
            timeouts,
            link: Mutex::new(Link {
                io: None,
                buffer: BytesMut::with_capacity(256),
                decoder: FrameDecoder::new(),
            }),
            pending_writes: AtomicUsize::new(0),
            writes_drained: Notify::new(),
            frames_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub async fn is_open(&self) -> bool {
        self.link.lock().await.io.is_some()
    }

    pub async fn open(&self) -> bool {
        let mut link = match tokio::time::timeout(self.timeouts.lock, self.link.lock()).await {
            Ok(link) => link,
            Err(_) => {
                warn!("{}: port busy, cannot open", self.name);
                return false;
            }
        };

        if link.io.is_some() {
            return true;
        }

        match self.connector.connect().await {
            Ok(io) => {
                info!("{}: opened {}", self.name, self.connector.describe());
                link.io = Some(io);
                link.buffer.clear();
                true
            }
            Err(err) => {
                error!("{}: {}", self.name, err);
                false
            }
        }
    }

    pub async fn close(&self) -> bool {
        let mut link = match tokio::time::timeout(self.timeouts.lock, self.link.lock()).await {
            Ok(link) => link,
            Err(_) => {
                warn!("{}: port busy, cannot close", self.name);
                return false;
            }
        };

        match link.io.take() {
            Some(mut io) => match io.shutdown().await {
                Ok(()) => {
                    info!("{}: closed", self.name);
                    true
                }
                Err(err) => {
                    warn!("{}: error while closing: {}", self.name, err);
                    false
                }
            },
            None => true,
        }
    }

    /// Sends one frame. The terminator is appended here.
    pub async fn write(&self, data: &[u8]) -> bool {
        let ok = self.write_frame(data).await;

        if ok {
            self.frames_written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
        }

        ok
    }

    async fn write_frame(&self, data: &[u8]) -> bool {
        let pending = PendingWrite::new(self);

        let mut link = match tokio::time::timeout(self.timeouts.lock, self.link.lock()).await {
            Ok(link) => link,
            Err(_) => {
                error!(
                    "{}: port blocked for {:?}, dropping write {:?}",
                    self.name,
                    self.timeouts.lock,
                    String::from_utf8_lossy(data)
                );
                return false;
            }
        };
        drop(pending);

        let io = match link.io.as_mut() {
            Some(io) => io,
            None => {
                error!("{}: write on closed port", self.name);
                return false;
            }
        };

        let result = tokio::time::timeout(self.timeouts.lock, async {
            io.write_all(data).await?;
            io.write_all(TERMINATOR).await?;
            io.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!("{}: TX {}", self.name, String::from_utf8_lossy(data));
                true
            }
            Ok(Err(err)) => {
                error!("{}: write failed: {}", self.name, err);
                link.io = None;
                false
            }
            Err(_) => {
                error!("{}: write timed out", self.name);
                false
            }
        }
    }

    // Bounded wait for announced writers to get the lock.
    async fn yield_to_writers(&self) {
        let deadline = Instant::now() + self.timeouts.lock;

        loop {
            let drained = self.writes_drained.notified();
            if self.pending_writes.load(Ordering::SeqCst) == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                debug!("{}: writers still pending, reading anyway", self.name);
                return;
            }
        }
    }

    /// Reads one frame, waiting at most `wait` for it to complete. `None` on
    /// timeout, transport error or a closed port.
    pub async fn read_framed(&self, wait: Duration) -> Option<BytesMut> {
        self.yield_to_writers().await;

        let mut guard = match tokio::time::timeout(self.timeouts.lock, self.link.lock()).await {
            Ok(link) => link,
            Err(_) => {
                debug!("{}: port busy, skipping read", self.name);
                return None;
            }
        };
        let link = &mut *guard;
        let deadline = Instant::now() + wait;

        loop {
            match link.decoder.decode(&mut link.buffer) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(err) => {
                    error!("{}: framing error: {}", self.name, err);
                    link.buffer.clear();
                    return None;
                }
            }

            let io = link.io.as_mut()?;

            let result = tokio::time::timeout_at(deadline, io.read_buf(&mut link.buffer)).await;
            match result {
                Err(_) => return None,
                Ok(Ok(0)) => {
                    warn!("{}: link closed by peer", self.name);
                    link.io = None;
                    return None;
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    error!("{}: read failed: {}", self.name, err);
                    link.io = None;
                    return None;
                }
            }
        }
    }

    /// Frames as they arrive, until `running` is cleared. A dropped link is
    /// reopened in between.
    pub fn read_stream(&self, running: RunFlag) -> impl Stream<Item = BytesMut> + '_ {
        futures::stream::unfold(running, move |running| async move {
            loop {
                if !running.is_running() {
                    return None;
                }

                if !self.is_open().await && !self.open().await {
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }

                if let Some(frame) = self.read_framed(self.timeouts.read).await {
                    return Some((frame, running));
                }

                tokio::time::sleep(STREAM_IDLE).await;
            }
        })
    }
}
