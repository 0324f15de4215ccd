//! Monitor backed by a consumer thread.

use super::Monitor;
use crate::error::{GradtopError, Result};
use crate::models::MetricReport;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Messages sent to the consumer thread.
#[derive(Debug)]
pub enum MonitorMessage {
    Report(MetricReport),
    Quit,
}

/// Forwards reports over a channel to a background consumer.
///
/// `tick` never blocks on the consumer. The consumer returns `false` to stop;
/// after that [`Monitor::is_running`] reports `false` and further ticks fail.
/// Dropping the monitor asks the thread to quit and joins it.
pub struct ChannelMonitor {
    sender: Sender<MonitorMessage>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChannelMonitor {
    pub fn spawn<F>(mut consumer: F) -> Self
    where
        F: FnMut(MetricReport) -> bool + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<MonitorMessage>();
        let running = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&running);
        let handle = std::thread::spawn(move || {
            while let Ok(message) = rx.recv() {
                match message {
                    MonitorMessage::Report(report) => {
                        if !consumer(report) {
                            debug!("Monitor consumer requested stop");
                            break;
                        }
                    }
                    MonitorMessage::Quit => break,
                }
            }
            flag.store(false, Ordering::SeqCst);
        });

        Self {
            sender: tx,
            running,
            handle: Some(handle),
        }
    }

    /// Consumer that logs each report with the range of the last `window` losses.
    pub fn loss_window(window: usize) -> Self {
        let mut losses = LossWindow::new(window);
        Self::spawn(move |report| {
            losses.push(report.loss);
            info!(
                "{} window[{}] min={:.4} max={:.4}",
                report,
                losses.len(),
                losses.min().unwrap_or(report.loss),
                losses.max().unwrap_or(report.loss)
            );
            true
        })
    }
}

/// The most recent losses, oldest first. Holds at least one value.
#[derive(Debug, Clone)]
pub struct LossWindow {
    capacity: usize,
    losses: VecDeque<f64>,
}

impl LossWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            losses: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a loss, evicting the oldest once the window is full.
    pub fn push(&mut self, loss: f64) {
        if self.losses.len() == self.capacity {
            self.losses.pop_front();
        }
        self.losses.push_back(loss);
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.losses.iter().copied()
    }

    pub fn min(&self) -> Option<f64> {
        self.iter().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.iter().reduce(f64::max)
    }
}

impl Monitor for ChannelMonitor {
    fn tick(&mut self, report: &MetricReport) -> Result<()> {
        self.sender
            .send(MonitorMessage::Report(report.clone()))
            .map_err(|_| GradtopError::Monitor("consumer thread has stopped".to_string()))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ChannelMonitor {
    fn drop(&mut self) {
        let _ = self.sender.send(MonitorMessage::Quit);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Monitor consumer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn report(step: u64) -> MetricReport {
        MetricReport::new(step, step as f64, BTreeMap::new(), BTreeMap::new())
    }

    #[test]
    fn test_reports_reach_consumer_before_drop_returns() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut monitor = ChannelMonitor::spawn(move |report| {
            sink.lock().unwrap().push(report.step);
            true
        });
        monitor.tick(&report(2)).unwrap();
        monitor.tick(&report(4)).unwrap();
        drop(monitor);

        assert_eq!(*seen.lock().unwrap(), vec![2, 4]);
    }

    #[test]
    fn test_consumer_can_stop_the_monitor() {
        let mut monitor = ChannelMonitor::spawn(|_| false);
        monitor.tick(&report(1)).unwrap();

        // The consumer exits after the first report
        let handle = monitor.handle.take().unwrap();
        handle.join().unwrap();

        assert!(!monitor.is_running());
        assert!(monitor.tick(&report(2)).is_err());
    }

    #[test]
    fn test_loss_window_evicts_oldest() {
        let mut window = LossWindow::new(3);
        assert!(window.is_empty());
        assert_eq!(window.min(), None);

        for loss in [5.0, 1.0, 4.0, 2.0, 3.0] {
            window.push(loss);
        }

        assert_eq!(window.len(), 3);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![4.0, 2.0, 3.0]);
        assert_eq!(window.min(), Some(2.0));
        assert_eq!(window.max(), Some(4.0));
    }

    #[test]
    fn test_loss_window_keeps_at_least_one() {
        let mut window = LossWindow::new(0);
        window.push(1.0);
        window.push(2.0);
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![2.0]);
    }

    #[test]
    fn test_loss_window_monitor_accepts_more_than_window() {
        let mut monitor = ChannelMonitor::loss_window(2);
        for step in 1..=5 {
            monitor.tick(&report(step)).unwrap();
        }
        assert!(monitor.is_running());
        drop(monitor);
    }
}
