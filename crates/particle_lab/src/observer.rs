//! Frame notifications
//!
//! The frame driver never calls observers on its own thread. Events go into
//! an `mpsc` channel drained by a dedicated dispatcher thread, so a slow
//! observer cannot stall frame submission.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

/// Receives frame lifecycle notifications on the dispatcher thread
pub trait FrameObserver: Send + 'static {
    /// A submitted frame finished executing on the device
    fn on_frame_updated(&mut self) {}

    /// No usable device; the simulation cannot start
    fn on_device_unavailable(&mut self, _reason: &str) {}

    /// Periodic frame-rate report
    fn on_statistics(&mut self, _fps: u32, _label: &str) {}
}

/// Observer that ignores everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullObserver;

impl FrameObserver for NullObserver {}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameEvent {
    FrameUpdated,
    DeviceUnavailable(String),
    Statistics { fps: u32, label: String },
}

impl FrameEvent {
    pub fn deliver(self, observer: &mut dyn FrameObserver) {
        match self {
            FrameEvent::FrameUpdated => observer.on_frame_updated(),
            FrameEvent::DeviceUnavailable(reason) => observer.on_device_unavailable(&reason),
            FrameEvent::Statistics { fps, label } => observer.on_statistics(fps, &label),
        }
    }
}

/// Observer that forwards every notification into a channel
#[derive(Clone, Debug)]
pub struct ChannelObserver {
    sender: mpsc::Sender<FrameEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::Sender<FrameEvent>) -> Self {
        Self { sender }
    }

    /// Observer plus the receiving end of its channel
    pub fn channel() -> (Self, mpsc::Receiver<FrameEvent>) {
        let (sender, receiver) = mpsc::channel();
        (Self::new(sender), receiver)
    }

    fn forward(&self, event: FrameEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.sender.send(event);
    }
}

impl FrameObserver for ChannelObserver {
    fn on_frame_updated(&mut self) {
        self.forward(FrameEvent::FrameUpdated);
    }

    fn on_device_unavailable(&mut self, reason: &str) {
        self.forward(FrameEvent::DeviceUnavailable(reason.to_string()));
    }

    fn on_statistics(&mut self, fps: u32, label: &str) {
        self.forward(FrameEvent::Statistics {
            fps,
            label: label.to_string(),
        });
    }
}

enum Message {
    Event(FrameEvent),
    Stop,
}

/// Cloneable handle for publishing events from any thread
#[derive(Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Message>,
}

impl EventSender {
    pub fn publish(&self, event: FrameEvent) {
        if self.sender.send(Message::Event(event)).is_err() {
            tracing::trace!("Event dispatcher stopped, dropping event");
        }
    }
}

/// Background thread delivering events to one observer
pub struct EventDispatcher {
    sender: Option<EventSender>,
    thread_handle: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    pub fn spawn(mut observer: Box<dyn FrameObserver>) -> Self {
        let (sender, receiver) = mpsc::channel::<Message>();

        let thread_handle = thread::spawn(move || {
            for message in receiver {
                match message {
                    Message::Event(event) => event.deliver(observer.as_mut()),
                    Message::Stop => break,
                }
            }
            tracing::debug!("Event dispatcher thread exiting");
        });

        Self {
            sender: Some(EventSender { sender }),
            thread_handle: Some(thread_handle),
        }
    }

    /// A handle for completion callbacks and other threads
    pub fn sender(&self) -> Option<EventSender> {
        self.sender.clone()
    }

    pub fn publish(&self, event: FrameEvent) {
        if let Some(sender) = &self.sender {
            sender.publish(event);
        }
    }

    /// Deliver everything queued so far and stop the thread
    ///
    /// Events published afterwards through outstanding `EventSender` clones
    /// are discarded.
    pub fn shutdown(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.sender.send(Message::Stop);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread::ThreadId;

    struct ThreadRecorder {
        threads: Arc<Mutex<Vec<ThreadId>>>,
    }

    impl FrameObserver for ThreadRecorder {
        fn on_frame_updated(&mut self) {
            self.threads.lock().unwrap().push(thread::current().id());
        }
    }

    #[test]
    fn test_events_delivered_in_order() {
        let (observer, receiver) = ChannelObserver::channel();
        let mut dispatcher = EventDispatcher::spawn(Box::new(observer));

        dispatcher.publish(FrameEvent::FrameUpdated);
        dispatcher.publish(FrameEvent::Statistics {
            fps: 60,
            label: "16 particles at 60 fps".into(),
        });
        dispatcher.publish(FrameEvent::DeviceUnavailable("lost".into()));
        dispatcher.shutdown();

        let events: Vec<FrameEvent> = receiver.try_iter().collect();
        assert_eq!(
            events,
            vec![
                FrameEvent::FrameUpdated,
                FrameEvent::Statistics {
                    fps: 60,
                    label: "16 particles at 60 fps".into()
                },
                FrameEvent::DeviceUnavailable("lost".into()),
            ]
        );
    }

    #[test]
    fn test_observer_runs_off_the_publishing_thread() {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::spawn(Box::new(ThreadRecorder {
            threads: Arc::clone(&threads),
        }));

        let sender = dispatcher.sender().unwrap();
        sender.publish(FrameEvent::FrameUpdated);
        dispatcher.shutdown();
        // Late events are dropped without blocking
        sender.publish(FrameEvent::FrameUpdated);

        let threads = threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], thread::current().id());
    }

    #[test]
    fn test_publish_after_shutdown_is_ignored() {
        let mut dispatcher = EventDispatcher::spawn(Box::new(NullObserver));
        dispatcher.shutdown();
        dispatcher.publish(FrameEvent::FrameUpdated);
        assert!(dispatcher.sender().is_none());
    }
}
