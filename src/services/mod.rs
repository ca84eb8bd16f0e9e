pub mod dispatch;
pub mod eventsub;
pub mod init;
pub mod overlay;
pub mod points;
pub mod presentation;
pub mod router;
pub mod twitch;
