pub mod app;
pub mod live;
pub mod manager;
pub mod prompts;
pub mod telemetry;
pub mod trader;

pub use app::run as run_app;
pub use manager::{LeaderboardRow, LeaderboardSettings, TraderManager};
pub use trader::{AccountInfo, AutoTrader, PositionView, TraderSettings, TraderStatus};
