//! Binary and timeline semaphores: the only cross-queue ordering
//! primitive. Waits accept a wall-clock deadline and return
//! `deadline-exceeded` on expiry.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tensile_base::{ref_object, Ref, Status, StatusResult};

/// A semaphore with a monotonically increasing payload value. A binary
/// semaphore is a timeline clamped to {0, 1} whose signal resets on a
/// successful wait.
pub struct Semaphore {
    value: Mutex<u64>,
    condvar: Condvar,
    timeline: bool,
}

ref_object!(Semaphore);

impl Semaphore {
    /// Creates a timeline semaphore at `initial`.
    pub fn timeline(initial: u64) -> Ref<Semaphore> {
        Ref::new(Self {
            value: Mutex::new(initial),
            condvar: Condvar::new(),
            timeline: true,
        })
    }

    /// Creates an unsignaled binary semaphore.
    pub fn binary() -> Ref<Semaphore> {
        Ref::new(Self {
            value: Mutex::new(0),
            condvar: Condvar::new(),
            timeline: false,
        })
    }

    pub fn is_timeline(&self) -> bool {
        self.timeline
    }

    /// Current payload value.
    pub fn query(&self) -> u64 {
        *self.value.lock()
    }

    /// Signals the semaphore to `value`. Timeline values must not
    /// decrease; a binary semaphore signals to 1.
    pub fn signal(&self, value: u64) -> StatusResult<()> {
        let mut current = self.value.lock();
        if self.timeline {
            if value < *current {
                return Err(Status::failed_precondition(format!(
                    "timeline semaphore cannot move backwards from {} to {value}",
                    *current
                )));
            }
            *current = value;
        } else {
            *current = 1;
        }
        self.condvar.notify_all();
        Ok(())
    }

    /// Waits until the payload reaches `target` or the deadline passes.
    /// A binary semaphore consumes its signal on success.
    pub fn wait(&self, target: u64, deadline: Option<Duration>) -> StatusResult<()> {
        let expiry = deadline.map(|timeout| Instant::now() + timeout);
        let mut current = self.value.lock();
        loop {
            let satisfied = if self.timeline {
                *current >= target
            } else {
                *current >= 1
            };
            if satisfied {
                if !self.timeline {
                    *current = 0;
                }
                return Ok(());
            }
            match expiry {
                Some(expiry) => {
                    if Instant::now() >= expiry {
                        return Err(Status::deadline_exceeded(format!(
                            "semaphore did not reach {target} before the deadline"
                        )));
                    }
                    // The condition is re-checked at loop top after waking.
                    let _ = self.condvar.wait_until(&mut current, expiry);
                }
                None => self.condvar.wait(&mut current),
            }
        }
    }
}

/// Waits for every (semaphore, target) pair before the deadline.
pub fn wait_all(
    semaphores: &[(Ref<Semaphore>, u64)],
    deadline: Option<Duration>,
) -> StatusResult<()> {
    let expiry = deadline.map(|timeout| Instant::now() + timeout);
    for (semaphore, target) in semaphores {
        let remaining = match expiry {
            Some(expiry) => Some(
                expiry
                    .checked_duration_since(Instant::now())
                    .ok_or_else(|| Status::deadline_exceeded("wait-all deadline passed"))?,
            ),
            None => None,
        };
        semaphore.get()?.wait(*target, remaining)?;
    }
    Ok(())
}

/// Waits until any one (semaphore, target) pair is satisfied. Polls the
/// set; returns the index of the first satisfied pair.
pub fn wait_any(
    semaphores: &[(Ref<Semaphore>, u64)],
    deadline: Option<Duration>,
) -> StatusResult<usize> {
    if semaphores.is_empty() {
        return Err(Status::invalid_argument("wait-any over an empty set"));
    }
    let expiry = deadline.map(|timeout| Instant::now() + timeout);
    loop {
        for (index, (semaphore, target)) in semaphores.iter().enumerate() {
            let semaphore = semaphore.get()?;
            if semaphore.is_timeline() {
                if semaphore.query() >= *target {
                    return Ok(index);
                }
            } else if semaphore.wait(1, Some(Duration::ZERO)).is_ok() {
                return Ok(index);
            }
        }
        if let Some(expiry) = expiry {
            if Instant::now() >= expiry {
                return Err(Status::deadline_exceeded(
                    "no semaphore was satisfied before the deadline",
                ));
            }
        }
        std::thread::sleep(Duration::from_micros(50));
    }
}
