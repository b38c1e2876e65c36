// Copyright 2025 Zhipu AI (Original Python implementation)
// Copyright 2025 ModerRAS (Rust implementation)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Browser Agent
//!
//! Resumable plan/execute/replan engine that drives a browser-automation
//! tool toward a natural-language goal.
//!
//! A planner service breaks the goal into steps, a browser driver executes
//! them one at a time, and the engine checkpoints after every transition so
//! a run can pause for approval or a human, be stopped, and pick up again
//! without replaying finished steps.
//!
//! ## Example
//!
//! ```rust,no_run
//! use browser_agent::{
//!     CommandDriver, CommandDriverConfig, Engine, FileCheckpointStore, HttpPlanner,
//!     JsonMemoryStore, ModelConfig, RunOptions,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let planner = HttpPlanner::new(
//!         ModelConfig::default()
//!             .with_base_url("https://api.deepseek.com/v1")
//!             .with_model_name("deepseek-chat"),
//!     );
//!     let driver = CommandDriver::new(CommandDriverConfig::default());
//!     let checkpoints = Arc::new(FileCheckpointStore::new("runs"));
//!     let memory = JsonMemoryStore::open("memory.json").await?;
//!
//!     let engine = Engine::new(Arc::new(planner), Arc::new(driver), checkpoints, Arc::new(memory));
//!     let run = engine
//!         .controller()
//!         .create("Find the cheapest USB-C cable", RunOptions::default())
//!         .await?;
//!
//!     let report = engine.run(run.id()).await?;
//!     println!("Run finished: {}", report.status.as_str());
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod browser;
pub mod config;
pub mod model;
pub mod planner;
pub mod settings;
pub mod store;

pub use agent::{
    ControlError, ControlOutcome, ControlRequest, Engine, EngineError, EngineEvent, EventCallback,
    EventSink, Plan, PlanStep, Preferences, RunController, RunOptions, RunReport, RunSnapshot,
    RunStatus, Settings, StepStatus, ToolSelector,
};
pub use browser::{
    BrowserDriver, BrowserSession, CommandDriver, CommandDriverConfig, ToolError, ToolOutcome,
};
pub use model::{ModelClient, ModelConfig, ModelResponse};
pub use planner::{HttpPlanner, Planner, PlannerContext, PlannerError};
pub use settings::AppSettings;
pub use store::{
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, JsonMemoryStore, MemoryStore,
};
