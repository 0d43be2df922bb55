//! 智能体运行层：坐标归一化、动作映射、done 强制判断、运行状态与步进主循环

pub mod actions;
pub mod coordinates;
pub mod done;
pub mod events;
pub mod loop_;
pub mod state;

pub use actions::{Action, ActionMapper, AgentAction, ReplayMapping};
pub use coordinates::{normalize_point, CoordinateNormalizer, CoordinateSpace, ViewportResolver};
pub use done::{DoneEnforcer, ForcedDone};
pub use events::StepEvent;
pub use loop_::{LoopState, RunOptions, StepLoop, StepLoopConfig};
pub use state::{AgentResult, AgentState};
