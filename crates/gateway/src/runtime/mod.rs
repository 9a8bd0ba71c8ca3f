pub mod emit;
pub mod external;
pub mod locks;
pub mod maintenance;
pub mod runner_events;
