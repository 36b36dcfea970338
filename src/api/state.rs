use crate::evidence::ScreenshotStore;
use crate::runner::{RunStore, TestRunner};
use crate::schedule::ScheduleManager;

#[derive(Clone)]
pub struct AppState {
    pub schedules: ScheduleManager,
    pub runs: RunStore,
    pub runner: TestRunner,
    pub shots: ScreenshotStore,
}
