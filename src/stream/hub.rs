use anyhow::Context;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use super::StreamEncoder;
use crate::frame::{BufferRead, FrameBuffer};

/// One encoded multipart part, shared by every client that receives it.
pub type Part = Arc<Vec<u8>>;

struct Client {
    id: u64,
    queue: Arc<FrameBuffer<Part>>,
}

struct HubInner {
    clients: Mutex<Vec<Client>>,
    next_id: AtomicU64,
    client_buffer: usize,
    closed: AtomicBool,
    published: AtomicU64,
}

impl HubInner {
    fn clients(&self) -> MutexGuard<'_, Vec<Client>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fans encoded parts out to any number of stream clients.
///
/// Every client owns a bounded drop-oldest queue, so a slow reader only loses
/// its own stale parts and never holds up the producer or other clients.
#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

impl StreamHub {
    pub fn new(client_buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                client_buffer: client_buffer.max(1),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new client. On a closed hub the subscription is already
    /// closed and yields nothing.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(FrameBuffer::with_capacity(self.inner.client_buffer));
        let mut clients = self.inner.clients();
        if self.is_closed() {
            queue.close();
        } else {
            clients.push(Client {
                id,
                queue: queue.clone(),
            });
        }
        drop(clients);
        log::debug!("stream client {} subscribed", id);
        Subscription {
            id,
            queue,
            hub: self.inner.clone(),
        }
    }

    /// Deliver `part` to every current client. Returns how many received it.
    pub fn publish(&self, part: Vec<u8>) -> usize {
        let part: Part = Arc::new(part);
        let clients = self.inner.clients();
        let delivered = clients
            .iter()
            .filter(|client| client.queue.push(part.clone()))
            .count();
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.clients().len()
    }

    pub fn parts_published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// End every subscription once its queued parts are drained.
    pub fn close(&self) {
        let clients = self.inner.clients();
        self.inner.closed.store(true, Ordering::SeqCst);
        for client in clients.iter() {
            client.queue.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// A client's view of the hub. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    queue: Arc<FrameBuffer<Part>>,
    hub: Arc<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait up to `timeout` for the next part.
    pub fn recv_timeout(&self, timeout: Duration) -> BufferRead<Part> {
        self.queue.pop_timeout(timeout)
    }

    /// Parts discarded because this client fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.clients().retain(|client| client.id != self.id);
        log::debug!(
            "stream client {} unsubscribed ({} parts dropped)",
            self.id,
            self.queue.dropped()
        );
    }
}

/// Running producer thread feeding a `StreamHub`.
pub struct ProducerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<u64>>,
}

impl ProducerHandle {
    /// Stop the producer and return how many parts it encoded.
    pub fn stop(mut self) -> anyhow::Result<u64> {
        self.stop.store(true, Ordering::SeqCst);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow::anyhow!("stream producer panicked")),
            None => Ok(0),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| thread.is_finished())
            .unwrap_or(true)
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Drive `encoder` on its own thread, publishing every part to `hub`.
///
/// Frames are always read so the source stays current, but they are only
/// transformed and encoded while at least one client is subscribed. When the
/// encoder runs out of frames the hub is closed.
pub fn spawn_producer(
    hub: StreamHub,
    mut encoder: StreamEncoder,
) -> anyhow::Result<ProducerHandle> {
    let stop = encoder.stop_flag();
    let thread = {
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("stream-producer".to_string())
            .spawn(move || {
                log::info!("stream producer started: {}", encoder.describe());
                while !stop.load(Ordering::SeqCst) {
                    let Some(frame) = encoder.next_frame() else {
                        break;
                    };
                    if hub.subscriber_count() == 0 {
                        continue;
                    }
                    match encoder.encode(frame) {
                        Ok(part) => {
                            hub.publish(part);
                        }
                        Err(err) => log::warn!("stream encode failed: {}", err),
                    }
                }
                hub.close();
                log::info!(
                    "stream producer stopped after {} parts",
                    encoder.parts_encoded()
                );
                encoder.parts_encoded()
            })
            .context("spawn stream producer")?
    };
    Ok(ProducerHandle {
        stop,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SyntheticSource;
    use crate::stream::{EncoderConfig, Passthrough};

    fn part(byte: u8) -> Vec<u8> {
        vec![byte; 4]
    }

    fn recv(sub: &Subscription) -> Option<u8> {
        match sub.recv_timeout(Duration::from_millis(20)) {
            BufferRead::Item(part) => Some(part[0]),
            _ => None,
        }
    }

    #[test]
    fn every_subscriber_receives_published_parts() {
        let hub = StreamHub::new(4);
        let a = hub.subscribe();
        let b = hub.subscribe();
        assert_eq!(hub.publish(part(1)), 2);
        assert_eq!(recv(&a), Some(1));
        assert_eq!(recv(&b), Some(1));
    }

    #[test]
    fn slow_client_drops_oldest_without_blocking() {
        let hub = StreamHub::new(2);
        let slow = hub.subscribe();
        for byte in 0..10 {
            hub.publish(part(byte));
        }
        assert_eq!(recv(&slow), Some(8));
        assert_eq!(recv(&slow), Some(9));
        assert_eq!(slow.dropped(), 8);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let hub = StreamHub::new(2);
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(part(1)), 0);
    }

    #[test]
    fn close_drains_then_ends_subscriptions() {
        let hub = StreamHub::new(2);
        let sub = hub.subscribe();
        hub.publish(part(3));
        hub.close();
        assert_eq!(recv(&sub), Some(3));
        assert!(matches!(
            sub.recv_timeout(Duration::from_millis(5)),
            BufferRead::Closed
        ));
        let late = hub.subscribe();
        assert!(matches!(
            late.recv_timeout(Duration::from_millis(5)),
            BufferRead::Closed
        ));
    }

    #[test]
    fn producer_closes_hub_when_source_ends() {
        let hub = StreamHub::new(8);
        let sub = hub.subscribe();
        let encoder = StreamEncoder::new(
            Box::new(SyntheticSource::new(16, 16).with_frame_limit(3).with_fps(100.0)),
            Box::new(Passthrough),
            EncoderConfig::default(),
        );
        let producer = spawn_producer(hub.clone(), encoder).unwrap();

        let mut received = 0;
        loop {
            match sub.recv_timeout(Duration::from_secs(2)) {
                BufferRead::Item(_) => received += 1,
                BufferRead::Closed => break,
                BufferRead::TimedOut => panic!("producer stalled"),
            }
        }
        assert_eq!(received, 3);
        assert_eq!(producer.stop().unwrap(), 3);
        assert!(hub.is_closed());
    }
}
