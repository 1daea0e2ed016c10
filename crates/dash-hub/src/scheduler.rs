use dash_core::state::Field;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Pending { deadline: Instant },
    Flushing,
}

/// Debounced broadcast scheduler.
///
/// The first dirty mark arms a single deadline; later marks inside the window
/// join the same flush without pushing the deadline out, so a field is never
/// held back longer than one debounce interval.
#[derive(Debug)]
pub struct Scheduler {
    debounce: Duration,
    phase: Phase,
    dirty: Vec<Field>,
}

impl Scheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            phase: Phase::Idle,
            dirty: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn dirty(&self) -> &[Field] {
        &self.dirty
    }

    /// Record dirty fields in mark order, ignoring repeats.
    pub fn mark<I>(&mut self, fields: I)
    where
        I: IntoIterator<Item = Field>,
    {
        for field in fields {
            if !self.dirty.contains(&field) {
                self.dirty.push(field);
            }
        }
        if self.phase == Phase::Idle && !self.dirty.is_empty() {
            self.phase = Phase::Pending {
                deadline: Instant::now() + self.debounce,
            };
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Pending { deadline } => Some(deadline),
            Phase::Idle | Phase::Flushing => None,
        }
    }

    /// Resolves when a flush is due. Never resolves while idle.
    pub async fn due(&self) {
        match self.deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Enter `Flushing` and hand over the dirty fields, in mark order.
    pub fn begin_flush(&mut self) -> Vec<Field> {
        self.phase = Phase::Flushing;
        std::mem::take(&mut self.dirty)
    }

    /// Back to `Idle`, or straight to `Pending` if marks arrived mid-flush.
    pub fn finish_flush(&mut self) {
        self.phase = Phase::Idle;
        if !self.dirty.is_empty() {
            self.phase = Phase::Pending {
                deadline: Instant::now() + self.debounce,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_mark_arms_deadline_and_later_marks_do_not_extend_it() {
        let mut scheduler = Scheduler::new(Duration::from_millis(16));
        assert_eq!(scheduler.phase(), Phase::Idle);

        scheduler.mark([Field::Builds]);
        let deadline = scheduler.deadline().expect("armed");
        tokio::time::advance(Duration::from_millis(10)).await;
        scheduler.mark([Field::LogEntries, Field::Builds]);
        assert_eq!(scheduler.deadline(), Some(deadline));
        assert_eq!(scheduler.dirty(), &[Field::Builds, Field::LogEntries]);
    }

    #[tokio::test(start_paused = true)]
    async fn due_resolves_at_deadline() {
        let mut scheduler = Scheduler::new(Duration::from_millis(16));
        scheduler.mark([Field::Connection]);
        let start = Instant::now();
        scheduler.due().await;
        assert_eq!(start.elapsed(), Duration::from_millis(16));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_scheduler_is_never_due() {
        let scheduler = Scheduler::new(Duration::from_millis(16));
        let waited = tokio::time::timeout(Duration::from_secs(5), scheduler.due()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn empty_mark_stays_idle() {
        let mut scheduler = Scheduler::new(Duration::from_millis(16));
        scheduler.mark(Vec::new());
        assert_eq!(scheduler.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn marks_during_flush_rearm_after_it() {
        let mut scheduler = Scheduler::new(Duration::from_millis(16));
        scheduler.mark([Field::Builds]);
        let fields = scheduler.begin_flush();
        assert_eq!(fields, vec![Field::Builds]);
        assert_eq!(scheduler.phase(), Phase::Flushing);

        scheduler.mark([Field::Problems]);
        assert_eq!(scheduler.phase(), Phase::Flushing);
        scheduler.finish_flush();
        assert!(matches!(scheduler.phase(), Phase::Pending { .. }));

        scheduler.begin_flush();
        scheduler.finish_flush();
        assert_eq!(scheduler.phase(), Phase::Idle);
    }
}
