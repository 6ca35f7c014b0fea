use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
};

use log::{error, info, warn};

use crate::KartcamError;

use super::{EventKind, FleetEvent};

const DISPATCHER_THREAD_NAME: &str = "kartcam-notify";

/// Receiver of fleet notifications.
///
/// Subscribers run on the dispatcher thread, never on the thread that committed the
/// state change. A subscriber that returns an error or panics is dropped.
pub trait EventSubscriber: Send {
    fn name(&self) -> &str;

    fn notify(&mut self, event: &FleetEvent) -> Result<(), KartcamError>;
}

/// Forwards events into a channel, dropped once the receiving side goes away.
pub struct ChannelSubscriber {
    name: String,
    sender: Sender<FleetEvent>,
}

impl ChannelSubscriber {
    pub fn new(name: impl Into<String>, sender: Sender<FleetEvent>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

impl EventSubscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn notify(&mut self, event: &FleetEvent) -> Result<(), KartcamError> {
        self.sender
            .send(event.clone())
            .map_err(|_| KartcamError::SubscriberError {
                name: self.name.clone(),
                reason: "receiver disconnected".to_string(),
            })
    }
}

/// Writes every event to the log, faults at warn level.
#[derive(Default)]
pub struct LogSubscriber;

impl EventSubscriber for LogSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&mut self, event: &FleetEvent) -> Result<(), KartcamError> {
        match event.kind {
            EventKind::LowBatteryCrossed | EventKind::ErrorEntered => {
                warn!("[{}] {}", event.timestamp.to_rfc3339(), event.message)
            }
            _ => info!("[{}] {}", event.timestamp.to_rfc3339(), event.message),
        }
        Ok(())
    }
}

enum DispatchMessage {
    Event(FleetEvent),
    Shutdown,
}

/// Handle used by the mutation path to queue events. Publishing never blocks.
#[derive(Clone)]
pub struct EventPublisher {
    queue: Sender<DispatchMessage>,
}

impl EventPublisher {
    pub fn publish(&self, event: FleetEvent) -> Result<(), KartcamError> {
        self.queue
            .send(DispatchMessage::Event(event))
            .map_err(|_| KartcamError::DispatcherClosed)
    }

    pub fn publish_all(
        &self,
        events: impl IntoIterator<Item = FleetEvent>,
    ) -> Result<(), KartcamError> {
        for event in events {
            self.publish(event)?;
        }
        Ok(())
    }
}

type Subscribers = Arc<Mutex<Vec<Box<dyn EventSubscriber>>>>;

/// Fans queued fleet events out to subscribers on a dedicated thread.
pub struct NotificationDispatcher {
    queue: Sender<DispatchMessage>,
    subscribers: Subscribers,
    worker: Option<JoinHandle<()>>,
}

impl NotificationDispatcher {
    pub fn start() -> Result<Self, KartcamError> {
        let (queue, queue_rx) = mpsc::channel::<DispatchMessage>();
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

        let worker_subscribers = Arc::clone(&subscribers);
        let worker = thread::Builder::new()
            .name(DISPATCHER_THREAD_NAME.to_string())
            .spawn(move || dispatch_loop(queue_rx, worker_subscribers))
            .map_err(|e| KartcamError::ThreadSpawnError {
                name: DISPATCHER_THREAD_NAME.to_string(),
                source: e,
            })?;

        Ok(Self {
            queue,
            subscribers,
            worker: Some(worker),
        })
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            queue: self.queue.clone(),
        }
    }

    pub fn subscribe(&self, subscriber: impl EventSubscriber + 'static) {
        info!("Adding notification subscriber '{}'", subscriber.name());
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(subscriber));
    }

    /// Subscribes a fresh channel and returns its receiving end.
    pub fn subscribe_channel(&self, name: impl Into<String>) -> Receiver<FleetEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribe(ChannelSubscriber::new(name, sender));
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers everything queued so far, then stops the dispatcher thread. Later
    /// publishes fail with [`KartcamError::DispatcherClosed`].
    pub fn shutdown(&mut self) -> Result<(), KartcamError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        // the worker may already be gone if a previous shutdown failed half way
        let _ = self.queue.send(DispatchMessage::Shutdown);
        worker.join().map_err(|_| KartcamError::ThreadJoinError {
            name: DISPATCHER_THREAD_NAME.to_string(),
        })
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Error while stopping notification dispatcher: {}", e);
        }
    }
}

fn dispatch_loop(queue: Receiver<DispatchMessage>, subscribers: Subscribers) {
    for message in queue {
        let event = match message {
            DispatchMessage::Event(event) => event,
            DispatchMessage::Shutdown => break,
        };
        let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain_mut(|subscriber| {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber.notify(&event))) {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!("Dropping subscriber '{}': {}", subscriber.name(), e);
                    false
                }
                Err(_) => {
                    error!(
                        "Subscriber '{}' panicked while handling {:?}, dropping it",
                        subscriber.name(),
                        event.kind
                    );
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fleet::{
        CameraStatus,
        test_support::{device, epoch},
    };

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    fn started_event(id: u32) -> FleetEvent {
        FleetEvent::download_started(&device(id, CameraStatus::Idle), epoch(0))
    }

    struct PanickingSubscriber;

    impl EventSubscriber for PanickingSubscriber {
        fn name(&self) -> &str {
            "panicking"
        }

        fn notify(&mut self, _event: &FleetEvent) -> Result<(), KartcamError> {
            panic!("subscriber bug");
        }
    }

    #[test]
    fn test_events_fan_out_in_order() {
        let dispatcher = NotificationDispatcher::start().unwrap();
        let first = dispatcher.subscribe_channel("first");
        let second = dispatcher.subscribe_channel("second");

        let publisher = dispatcher.publisher();
        publisher
            .publish_all([started_event(1), started_event(2)])
            .unwrap();

        for receiver in [&first, &second] {
            assert_eq!(receiver.recv_timeout(RECV_TIMEOUT).unwrap().device_id, 1);
            assert_eq!(receiver.recv_timeout(RECV_TIMEOUT).unwrap().device_id, 2);
        }
    }

    #[test]
    fn test_failing_subscribers_are_dropped() {
        let mut dispatcher = NotificationDispatcher::start().unwrap();
        dispatcher.subscribe(PanickingSubscriber);
        let gone = dispatcher.subscribe_channel("gone");
        drop(gone);
        let healthy = dispatcher.subscribe_channel("healthy");

        let publisher = dispatcher.publisher();
        publisher.publish(started_event(1)).unwrap();
        publisher.publish(started_event(2)).unwrap();

        assert_eq!(healthy.recv_timeout(RECV_TIMEOUT).unwrap().device_id, 1);
        assert_eq!(healthy.recv_timeout(RECV_TIMEOUT).unwrap().device_id, 2);
        dispatcher.shutdown().unwrap();
        assert_eq!(dispatcher.subscriber_count(), 1);
    }

    #[test]
    fn test_shutdown_drains_queue_and_closes_publishers() {
        let mut dispatcher = NotificationDispatcher::start().unwrap();
        let receiver = dispatcher.subscribe_channel("drain");
        let publisher = dispatcher.publisher();
        for id in 1..=5 {
            publisher.publish(started_event(id)).unwrap();
        }

        dispatcher.shutdown().unwrap();
        assert_eq!(receiver.try_iter().count(), 5);
        assert!(matches!(
            publisher.publish(started_event(6)),
            Err(KartcamError::DispatcherClosed)
        ));

        // a second shutdown is a no-op
        dispatcher.shutdown().unwrap();
    }
}
