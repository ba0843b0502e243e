pub mod checkpoint;
pub mod controller;
pub mod decision;
pub mod engine;
pub mod ignore;
pub mod local_watcher;
pub mod metadata;
pub mod paths;
pub mod poller;
pub mod queue;
pub mod status;
