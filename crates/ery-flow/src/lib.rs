//! Stage flow engine for Ery modules.
//!
//! This crate implements the core of a module run: the authoring catalog,
//! condition trees compiled to expressions, ordered redirect selection,
//! template-inherited content blocks, breadcrumb history with back/replay and
//! repair on deletion, pre-action steps, checkpoint/restore, and the catalog
//! lint rules.

pub mod action;
pub mod blocks;
pub mod breadcrumb;
pub mod catalog;
pub mod checkpoint;
pub mod condition;
pub mod engine;
pub mod events;
pub mod redirect;
pub mod runtime;
pub mod validation;

pub use action::{Action, ActionKind, ActionOutcome, ActionRunner, ActionStep};
pub use blocks::{
    get_blocks, stage_template_for, template_readiness, BlockInfo, BlockType, Generation, TemplateChain,
};
pub use breadcrumb::{plan_repair, BreadcrumbArena, BreadcrumbId, LinkChange, RepairPlan, StageBreadcrumb};
pub use catalog::{
    BlockTranslation, BreadcrumbType, Catalog, CatalogDocument, ContentBlock, ModuleDefinition, Redirect,
    StageDefinition, StageKey, StageRef, StageTemplate, Template, VariableDefinition, ROOT_BLOCK_NAME,
};
pub use condition::{
    normalize_expression, sub_condition_cycles, BinaryOperator, Comparator, Condition, ConditionCompiler,
    ConditionRecord, ConditionSource, Operand, OperandType, Relation,
};
pub use engine::{DeletionReport, FlowConfig, FlowEngine, Transition};
pub use events::{EventEmitter, FlowEvent};
pub use redirect::{get_redirect_stage, ordered_redirects, select_redirect, RedirectEvaluation, RedirectSelection};
pub use runtime::{Hand, HandId, HandStatus, Runtime, Stage, StageId};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
pub use checkpoint::{clear_checkpoint, load_checkpoint, save_checkpoint, HandRecord, RuntimeCheckpoint};
