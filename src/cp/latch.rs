use super::{OpError, Reply};

/// Counts down to zero once per round; only a spent latch can be re-armed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatchState {
    remaining: u32,
    round: u64,
}

impl LatchState {
    pub fn try_set_count(&mut self, count: u32) -> Result<Reply, OpError> {
        if count == 0 {
            return Err(OpError::InvalidArgument("latch count must be positive".into()));
        }
        if self.remaining > 0 {
            return Ok(Reply::CountSet(false));
        }
        self.remaining = count;
        self.round += 1;
        Ok(Reply::CountSet(true))
    }

    pub fn count_down(&mut self) -> Reply {
        self.remaining = self.remaining.saturating_sub(1);
        self.get()
    }

    pub fn get(&self) -> Reply {
        Reply::Count {
            remaining: self.remaining,
            round: self.round,
        }
    }
}
