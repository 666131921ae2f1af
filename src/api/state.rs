use std::path::PathBuf;

use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub results_dir: PathBuf,
    pub events_dir: PathBuf,
}
