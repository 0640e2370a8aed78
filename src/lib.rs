pub mod catalog;
pub mod error;
pub mod settings;
pub mod storage;
pub mod platform {
    pub mod panel_command;
}
pub mod processing {
    pub mod panel;
}
pub mod tasks {
    pub mod converter;
    pub mod display;
    pub mod monitor;
    pub mod scheduler;
}
