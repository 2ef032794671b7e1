//! Pausable countdown bounding a single inbound request.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Idle,
    Running,
    Paused,
    Finished,
    Cancelled,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer was already started")]
    AlreadyStarted,
    #[error("timer is not running")]
    NotRunning,
    #[error("timer is not paused")]
    NotPaused,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    Running { deadline: Instant },
    Paused { remaining: Duration },
    Finished,
    Cancelled,
}

/// Clones share the same countdown.
#[derive(Debug, Clone)]
pub struct Timer {
    duration: Duration,
    phase: Arc<watch::Sender<Phase>>,
}

impl Timer {
    pub fn new(duration: Duration) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            duration,
            phase: Arc::new(phase),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn status(&self) -> TimerStatus {
        match *self.phase.borrow() {
            Phase::Idle => TimerStatus::Idle,
            Phase::Running { .. } => TimerStatus::Running,
            Phase::Paused { .. } => TimerStatus::Paused,
            Phase::Finished => TimerStatus::Finished,
            Phase::Cancelled => TimerStatus::Cancelled,
        }
    }

    /// Time left before the timer fires, if it has not fired or been cancelled.
    pub fn remaining(&self) -> Option<Duration> {
        match *self.phase.borrow() {
            Phase::Idle => Some(self.duration),
            Phase::Running { deadline } => Some(deadline.saturating_duration_since(Instant::now())),
            Phase::Paused { remaining } => Some(remaining),
            Phase::Finished | Phase::Cancelled => None,
        }
    }

    pub fn start(&self) -> Result<(), TimerError> {
        let duration = self.duration;
        self.transition(|phase| match phase {
            Phase::Idle => Ok(Phase::Running {
                deadline: Instant::now() + duration,
            }),
            _ => Err(TimerError::AlreadyStarted),
        })
    }

    pub fn pause(&self) -> Result<(), TimerError> {
        self.transition(|phase| match phase {
            Phase::Running { deadline } => Ok(Phase::Paused {
                remaining: deadline.saturating_duration_since(Instant::now()),
            }),
            _ => Err(TimerError::NotRunning),
        })
    }

    pub fn resume(&self) -> Result<(), TimerError> {
        self.transition(|phase| match phase {
            Phase::Paused { remaining } => Ok(Phase::Running {
                deadline: Instant::now() + remaining,
            }),
            _ => Err(TimerError::NotPaused),
        })
    }

    /// Fires the timer now, waking everything awaiting [`Timer::expired`].
    pub fn finish(&self) {
        self.phase.send_if_modified(|phase| match phase {
            Phase::Finished | Phase::Cancelled => false,
            _ => {
                *phase = Phase::Finished;
                true
            }
        });
    }

    /// Stops the countdown for good; [`Timer::expired`] will never complete.
    pub fn cancel(&self) {
        self.phase.send_if_modified(|phase| match phase {
            Phase::Finished | Phase::Cancelled => false,
            _ => {
                *phase = Phase::Cancelled;
                true
            }
        });
    }

    /// Completes once the full duration has elapsed while running, or when
    /// the timer is finished early.
    pub async fn expired(&self) {
        let mut rx = self.phase.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            match phase {
                Phase::Finished => return,
                Phase::Running { deadline } => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            let fired = self.phase.send_if_modified(|current| match *current {
                                Phase::Running { deadline } if deadline <= Instant::now() => {
                                    *current = Phase::Finished;
                                    true
                                }
                                _ => false,
                            });
                            if fired {
                                return;
                            }
                        }
                        _ = rx.changed() => {}
                    }
                }
                Phase::Idle | Phase::Paused { .. } | Phase::Cancelled => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    fn transition(
        &self,
        apply: impl FnOnce(Phase) -> Result<Phase, TimerError>,
    ) -> Result<(), TimerError> {
        let mut outcome = Ok(());
        self.phase.send_if_modified(|phase| match apply(*phase) {
            Ok(next) => {
                *phase = next;
                true
            }
            Err(err) => {
                outcome = Err(err);
                false
            }
        });
        outcome
    }
}
