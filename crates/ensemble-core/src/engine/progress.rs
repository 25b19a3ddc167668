use crate::core::models::ids::Rank;

#[derive(Debug, Clone)]
pub enum Progress {
    FleetStart { total_units: u64, workers: usize },
    UnitDispatched { rank: Rank, name: String },
    UnitCompleted { rank: Rank },
    UnitAbandoned { rank: Rank, name: String },
    WorkerRetired { rank: Rank, remaining: usize },
    ShutdownRequested { abandoned: usize },
    FleetFinish,

    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

#[derive(Default)]
pub struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }
}
