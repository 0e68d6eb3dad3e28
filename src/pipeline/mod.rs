pub mod reasoning;
pub mod analysis; // Analysis orchestration engine
