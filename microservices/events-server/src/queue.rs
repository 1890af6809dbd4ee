//! In-memory FIFO between the fetch side and the persist side
//!
//! Bounded: `put` waits for free space rather than dropping, so a slow
//! sink back-pressures the stream reader.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use events_core::{Component, EventsError, Result};

#[async_trait]
pub trait Queue: Component {
    /// Enqueue one item, waiting while the queue is full
    async fn put(&self, item: String) -> Result<()>;

    /// Hand out the consumer side. The stream ends once the queue is closed
    /// and drained. Only one consumer may be attached.
    fn get(&self) -> Result<BoxStream<'static, String>>;

    /// Stop accepting items; the consumer drains what is left
    fn close(&self);

    /// Items currently buffered
    fn depth(&self) -> usize;
}

#[derive(Default)]
struct Channel {
    tx: Option<mpsc::Sender<String>>,
    rx: Option<mpsc::Receiver<String>>,
    initialized: bool,
}

pub struct MemoryQueue {
    capacity: usize,
    channel: Mutex<Channel>,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channel: Mutex::new(Channel::default()),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<String>> {
        let channel = self.channel.lock();
        match (&channel.tx, channel.initialized) {
            (Some(tx), _) => Ok(tx.clone()),
            (None, false) => Err(EventsError::Queue("queue is not initialized".to_string())),
            (None, true) => Err(EventsError::Queue("queue is closed".to_string())),
        }
    }
}

#[async_trait]
impl Component for MemoryQueue {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn init(&self) -> Result<()> {
        debug!(capacity = self.capacity, "queue: init");

        if self.capacity == 0 {
            return Err(EventsError::Config(
                "queue.capacity must be positive".to_string(),
            ));
        }

        let mut channel = self.channel.lock();
        if !channel.initialized {
            let (tx, rx) = mpsc::channel(self.capacity);
            channel.tx = Some(tx);
            channel.rx = Some(rx);
            channel.initialized = true;
        }
        Ok(())
    }

    async fn deinit(&self) -> Result<()> {
        debug!("queue: deinit");
        self.close();
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn put(&self, item: String) -> Result<()> {
        let tx = self.sender()?;
        tx.send(item)
            .await
            .map_err(|_| EventsError::Queue("queue consumer is gone".to_string()))
    }

    fn get(&self) -> Result<BoxStream<'static, String>> {
        let mut channel = self.channel.lock();
        if !channel.initialized {
            return Err(EventsError::Queue("queue is not initialized".to_string()));
        }

        let rx = channel
            .rx
            .take()
            .ok_or_else(|| EventsError::Queue("queue consumer already attached".to_string()))?;

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    fn close(&self) {
        if self.channel.lock().tx.take().is_some() {
            debug!("Queue closed");
        }
    }

    fn depth(&self) -> usize {
        let channel = self.channel.lock();
        match &channel.tx {
            Some(tx) => tx.max_capacity() - tx.capacity(),
            None => 0,
        }
    }
}
