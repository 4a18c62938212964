//! First-result-wins race over concurrently running tasks.
//!
//! A [`Race`] runs any number of tasks, each of which either wins with a
//! value, fails with an error, or stops without reporting anything. The first
//! win becomes the race result and fires the `dead` token. Winning does not
//! stop the other tasks: the owner decides when to [`Race::close`] or
//! [`Race::kill`] the race, and [`Race::wait`] joins every task before
//! returning, so nothing outlives the owner's teardown.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How a racing task finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finish<T, E> {
    /// The task produced a result. Only the first one is kept.
    Won(T),
    /// The task gave up with an error.
    Failed(E),
    /// The task was stopped before it had anything to report.
    Stopped,
}

/// Returned by [`Race::start`] once the race no longer accepts tasks.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("race is closed")]
pub struct RaceClosed;

/// Terminal outcome of a race that produced no winner.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaceError<E> {
    /// The race was closed before any task reported an error.
    #[error("race stopped")]
    Stopped,
    /// The error reported by the task that failed last.
    #[error("{0}")]
    Failed(E),
}

#[derive(Debug)]
struct Outcome<T, E> {
    winner: Option<T>,
    last_error: Option<E>,
}

#[derive(Debug)]
struct Shared<T, E> {
    outcome: Mutex<Outcome<T, E>>,
    dead: CancellationToken,
}

impl<T, E> Shared<T, E> {
    fn lock(&self) -> MutexGuard<'_, Outcome<T, E>> {
        match self.outcome.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, finish: Finish<T, E>) {
        let mut outcome = self.lock();
        match finish {
            Finish::Won(value) => {
                if outcome.winner.is_none() {
                    outcome.winner = Some(value);
                    self.dead.cancel();
                }
            }
            Finish::Failed(err) => outcome.last_error = Some(err),
            Finish::Stopped => {}
        }
    }
}

/// A set of tasks racing to produce the first result.
///
/// # Examples
///
/// ```
/// use clusterboot::race::{Finish, Race};
///
/// # tokio::runtime::Runtime::new().expect("runtime").block_on(async {
/// let mut race: Race<u32, String> = Race::new();
/// race.start(|_dying| async { Finish::Failed("slow".to_owned()) })
///     .expect("race open");
/// race.start(|_dying| async { Finish::Won(7) }).expect("race open");
/// assert_eq!(race.wait().await, Ok(7));
/// # });
/// ```
#[derive(Debug)]
pub struct Race<T, E> {
    shared: Arc<Shared<T, E>>,
    dying: CancellationToken,
    tasks: JoinSet<()>,
    closed: bool,
}

impl<T, E> Default for Race<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self { Self::new() }
}

impl<T, E> Race<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create an empty, open race.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                outcome: Mutex::new(Outcome {
                    winner: None,
                    last_error: None,
                }),
                dead: CancellationToken::new(),
            }),
            dying: CancellationToken::new(),
            tasks: JoinSet::new(),
            closed: false,
        }
    }

    /// Spawn a task into the race.
    ///
    /// The task receives the race's `dying` token, which fires when the race
    /// is killed.
    ///
    /// # Errors
    ///
    /// Returns [`RaceClosed`] if the race has been closed or killed.
    pub fn start<F, Fut>(&mut self, task: F) -> Result<(), RaceClosed>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Finish<T, E>> + Send + 'static,
    {
        if self.closed {
            return Err(RaceClosed);
        }
        let fut = task(self.dying.clone());
        let shared = Arc::clone(&self.shared);
        self.tasks.spawn(async move {
            let finish = fut.await;
            shared.record(finish);
        });
        Ok(())
    }

    /// Stop accepting new tasks. Running tasks are left alone.
    pub const fn close(&mut self) { self.closed = true; }

    /// Close the race and tell every running task to stop.
    pub fn kill(&mut self) {
        self.close();
        self.dying.cancel();
        self.shared.dead.cancel();
    }

    /// Token that fires once a winner is known or the race is over.
    #[must_use]
    pub fn dead(&self) -> CancellationToken { self.shared.dead.clone() }

    /// Close the race, join every task, and report the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`RaceError::Failed`] with the error reported last when no task
    /// won, or [`RaceError::Stopped`] when no task reported an error either.
    pub async fn wait(&mut self) -> Result<T, RaceError<E>>
    where
        T: Clone,
    {
        self.close();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(error) = joined {
                warn!(%error, "race task did not complete");
            }
        }
        self.shared.dead.cancel();
        let mut outcome = self.shared.lock();
        if let Some(winner) = outcome.winner.as_ref() {
            return Ok(winner.clone());
        }
        outcome
            .last_error
            .take()
            .map_or(Err(RaceError::Stopped), |err| Err(RaceError::Failed(err)))
    }

    /// The winning value, once one has been recorded.
    #[must_use]
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.shared.lock().winner.clone()
    }
}

impl<T, E> Drop for Race<T, E> {
    fn drop(&mut self) { self.dying.cancel(); }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use tokio::time::sleep;

    use super::*;

    #[rstest]
    #[tokio::test]
    async fn first_win_is_kept() {
        let mut race: Race<&'static str, String> = Race::new();
        race.start(|_| async { Finish::Won("first") }).expect("open");
        race.dead().cancelled().await;
        race.start(|_| async { Finish::Won("second") }).expect("open");

        assert_eq!(race.wait().await, Ok("first"));
        assert_eq!(race.result(), Some("first"));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn winning_leaves_losers_running() {
        let mut race: Race<u8, String> = Race::new();
        let loser_stopped = CancellationToken::new();
        let observed = loser_stopped.clone();
        race.start(move |dying| async move {
            dying.cancelled().await;
            observed.cancel();
            Finish::Stopped
        })
        .expect("open");
        race.start(|_| async { Finish::Won(1) }).expect("open");

        race.dead().cancelled().await;
        sleep(Duration::from_secs(1)).await;
        assert!(!loser_stopped.is_cancelled());

        race.kill();
        assert_eq!(race.wait().await, Ok(1));
        assert!(loser_stopped.is_cancelled());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn last_error_is_reported() {
        let mut race: Race<u8, &'static str> = Race::new();
        race.start(|_| async { Finish::Failed("early") }).expect("open");
        race.start(|_| async {
            sleep(Duration::from_millis(10)).await;
            Finish::Failed("late")
        })
        .expect("open");

        assert_eq!(race.wait().await, Err(RaceError::Failed("late")));
    }

    #[rstest]
    #[tokio::test]
    async fn closed_without_reports_is_stopped() {
        let mut race: Race<u8, String> = Race::new();
        race.start(|_| async { Finish::Stopped }).expect("open");

        assert_eq!(race.wait().await, Err(RaceError::Stopped));
        assert!(race.dead().is_cancelled());
    }

    #[rstest]
    fn start_after_close_is_refused() {
        let mut race: Race<u8, String> = Race::new();
        race.close();

        let refused = race.start(|_| async { Finish::Won(1) });

        assert_eq!(refused, Err(RaceClosed));
    }
}
