mod global;
mod loader;
mod root;
mod translate;

pub use global::{f_args, field, Bib4MissAction, FilteringConfig, GlobalConfig, Timeouts, TimerType};
pub use loader::load_from_path;
pub use root::{Config, InstanceConfig, Pool4SliceConfig};
pub use translate::{next_lower_plateau, normalize_plateaus, TranslateConfig, DEFAULT_PLATEAUS};
