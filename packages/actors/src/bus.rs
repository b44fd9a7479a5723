//! In-process publish/subscribe bus.
//!
//! Subjects are `.`-separated tokens such as `job.completed.<job_id>`.
//! Subscription patterns may use `*` for exactly one token and a trailing
//! `>` for one or more remaining tokens.
//!
//! - Delivery is synchronous, in registration order, on the publisher's task
//! - A failing subscriber does not stop delivery to the others
//! - Nothing crosses process boundaries

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

/// Receiver of bus publications.
pub trait Subscriber: Send + Sync {
    fn on_message(&self, sender: &str, subject: &str, payload: &Value) -> Result<(), String>;
}

impl<F> Subscriber for F
where
    F: Fn(&str, &str, &Value) -> Result<(), String> + Send + Sync,
{
    fn on_message(&self, sender: &str, subject: &str, payload: &Value) -> Result<(), String> {
        self(sender, subject, payload)
    }
}

/// One publication, as observed by [`MessageBus::await_any`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub sender: String,
    pub subject: String,
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid subscription pattern: {0:?}")]
    InvalidPattern(String),

    #[error("Invalid subject: {0:?}")]
    InvalidSubject(String),

    #[error("{} subscriber(s) failed on {subject}: {}", errors.len(), errors.join("; "))]
    Delivery { subject: String, errors: Vec<String> },
}

struct Subscription {
    pattern: String,
    target: Arc<dyn Subscriber>,
}

/// Process-local message bus.
#[derive(Default)]
pub struct MessageBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `target` for every subject matching `pattern`.
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        target: Arc<dyn Subscriber>,
    ) -> Result<(), BusError> {
        let pattern = pattern.into();
        if !is_valid_pattern(&pattern) {
            return Err(BusError::InvalidPattern(pattern));
        }

        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscriptions.push(Subscription { pattern, target });
        Ok(())
    }

    /// Remove the subscription of exactly this target under this pattern.
    ///
    /// Returns `false` if there was none.
    pub fn unsubscribe(&self, pattern: &str, target: &Arc<dyn Subscriber>) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscriptions.len();
        subscriptions
            .retain(|sub| !(sub.pattern == pattern && Arc::ptr_eq(&sub.target, target)));
        subscriptions.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Deliver a publication to every matching subscriber.
    ///
    /// Returns the number of subscribers reached. Subscriber failures are
    /// collected and reported together after everyone was called.
    pub fn publish(&self, sender: &str, subject: &str, payload: &Value) -> Result<usize, BusError> {
        if !is_valid_subject(subject) {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }

        // Subscribers may subscribe or unsubscribe while being called.
        let targets: Vec<Arc<dyn Subscriber>> = self
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|sub| subject_matches(&sub.pattern, subject))
            .map(|sub| sub.target.clone())
            .collect();

        let mut errors = Vec::new();
        for target in &targets {
            if let Err(err) = target.on_message(sender, subject, payload) {
                errors.push(err);
            }
        }

        if errors.is_empty() {
            Ok(targets.len())
        } else {
            Err(BusError::Delivery {
                subject: subject.to_string(),
                errors,
            })
        }
    }

    /// Wait until one of `subjects` is published or `timeout` elapses.
    ///
    /// Entries of `subjects` may be patterns. Returns `None` on timeout.
    pub async fn await_any(&self, subjects: &[String], timeout: Duration) -> Option<Published> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target: Arc<dyn Subscriber> =
            Arc::new(move |sender: &str, subject: &str, payload: &Value| {
                // The waiter may already be gone; that is not a delivery failure.
                let _ = tx.send(Published {
                    sender: sender.to_string(),
                    subject: subject.to_string(),
                    payload: payload.clone(),
                });
                Ok(())
            });

        let mut guard = SubscriptionGuard {
            bus: self,
            target: target.clone(),
            patterns: Vec::with_capacity(subjects.len()),
        };
        for subject in subjects {
            if self.subscribe(subject.clone(), target.clone()).is_ok() {
                guard.patterns.push(subject.clone());
            } else {
                tracing::warn!("Ignoring invalid wait subject {:?}", subject);
            }
        }
        if guard.patterns.is_empty() {
            return None;
        }

        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

/// Removes the temporary subscriptions of `await_any`, however it ends.
struct SubscriptionGuard<'a> {
    bus: &'a MessageBus,
    target: Arc<dyn Subscriber>,
    patterns: Vec<String>,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        for pattern in &self.patterns {
            self.bus.unsubscribe(pattern, &self.target);
        }
    }
}

fn is_valid_subject(subject: &str) -> bool {
    subject
        .split('.')
        .all(|token| !token.is_empty() && token != "*" && token != ">")
}

fn is_valid_pattern(pattern: &str) -> bool {
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;
    tokens
        .iter()
        .enumerate()
        .all(|(i, token)| !token.is_empty() && (*token != ">" || i == last))
}

/// Whether `subject` matches the subscription `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn recorder(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn Subscriber> {
        Arc::new(move |_: &str, subject: &str, _: &Value| {
            log.lock().unwrap().push(format!("{name}:{subject}"));
            Ok(())
        })
    }

    #[test]
    fn wildcards_match_one_or_more_tokens() {
        assert!(subject_matches("job.completed.*", "job.completed.01H"));
        assert!(!subject_matches("job.completed.*", "job.completed"));
        assert!(!subject_matches("job.completed.*", "job.completed.01H.extra"));
        assert!(subject_matches("job.>", "job.completed.01H"));
        assert!(!subject_matches("job.>", "job"));
        assert!(subject_matches("jobs.expunged", "jobs.expunged"));
        assert!(!subject_matches("jobs.expunged", "jobs.expunged.now"));
    }

    #[test]
    fn invalid_patterns_and_subjects_are_rejected() {
        let bus = MessageBus::new();
        let target: Arc<dyn Subscriber> = Arc::new(|_: &str, _: &str, _: &Value| Ok(()));
        assert!(matches!(
            bus.subscribe("job.>.completed", target.clone()),
            Err(BusError::InvalidPattern(_))
        ));
        assert!(matches!(
            bus.subscribe("job..completed", target),
            Err(BusError::InvalidPattern(_))
        ));
        assert!(matches!(
            bus.publish("a", "job.*", &Value::Null),
            Err(BusError::InvalidSubject(_))
        ));
    }

    #[test]
    fn delivery_is_in_registration_order_and_survives_failures() {
        let bus = MessageBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("job.>", recorder(log.clone(), "first")).unwrap();
        bus.subscribe(
            "job.completed.*",
            Arc::new(|_: &str, _: &str, _: &Value| Err("boom".to_string())),
        )
        .unwrap();
        bus.subscribe("job.completed.*", recorder(log.clone(), "third"))
            .unwrap();
        bus.subscribe("job.started.*", recorder(log.clone(), "other"))
            .unwrap();

        let result = bus.publish("msid-a", "job.completed.1", &json!({}));
        match result {
            Err(BusError::Delivery { errors, .. }) => assert_eq!(errors, vec!["boom"]),
            other => panic!("unexpected publish result: {other:?}"),
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:job.completed.1", "third:job.completed.1"]
        );
    }

    #[test]
    fn unsubscribe_removes_only_the_given_target() {
        let bus = MessageBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(log.clone(), "a");
        let b = recorder(log.clone(), "b");

        bus.subscribe("job.*.1", a.clone()).unwrap();
        bus.subscribe("job.*.1", b.clone()).unwrap();
        assert!(bus.unsubscribe("job.*.1", &a));
        assert!(!bus.unsubscribe("job.*.1", &a));

        assert_eq!(bus.publish("x", "job.started.1", &Value::Null).unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["b:job.started.1"]);
    }

    #[tokio::test]
    async fn await_any_returns_first_matching_publication() {
        let bus = Arc::new(MessageBus::new());
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = publisher.publish("msid-b", "job.started.9", &json!({"n": 1}));
            let _ = publisher.publish("msid-b", "job.completed.9", &json!({"n": 2}));
        });

        let published = bus
            .await_any(&["job.completed.9".to_string()], Duration::from_secs(5))
            .await;
        assert_eq!(
            published,
            Some(Published {
                sender: "msid-b".to_string(),
                subject: "job.completed.9".to_string(),
                payload: json!({"n": 2}),
            })
        );
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn await_any_times_out() {
        let bus = MessageBus::new();
        let started = std::time::Instant::now();
        let published = bus
            .await_any(&["job.completed.1".to_string()], Duration::from_millis(50))
            .await;
        assert!(published.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
