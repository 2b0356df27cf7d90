//! Catalog validation: lint rules and diagnostics.
//!
//! A catalog loaded from JSON bypasses the checked authoring operations, so
//! [`validate`] re-checks every structural invariant and adds advisory
//! warnings. [`validate_or_raise`] fails when any `Error` diagnostic is found.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use ery_types::{EryError, Result};

use crate::action::ActionKind;
use crate::blocks::template_readiness;
use crate::catalog::{Catalog, ModuleDefinition, StageKey};
use crate::condition::{sub_condition_cycles, Operand};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    /// Object the diagnostic is about, e.g. `"survey/Intro"` or `"Template 'Base'"`.
    pub location: Option<String>,
    pub field: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    fn error(rule: &str, location: impl Into<String>, field: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message: message.into(),
            location: Some(location.into()),
            field: Some(field.into()),
            fix: None,
        }
    }

    fn warning(rule: &str, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Warning,
            message: message.into(),
            location: Some(location.into()),
            field: None,
            fix: None,
        }
    }

    fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules: modules and stage definitions
// ---------------------------------------------------------------------------

struct StartStageRule;
impl LintRule for StartStageRule {
    fn name(&self) -> &str { "start_stage" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        catalog
            .modules()
            .filter(|m| m.stage_definition(&m.start_stage).is_none())
            .map(|m| {
                Diagnostic::error(
                    self.name(),
                    format!("ModuleDefinition '{}'", m.name),
                    "start_stage",
                    format!("start stage '{}' of module '{}' does not exist", m.start_stage, m.name),
                )
                .with_fix(format!(
                    "Add stage definition '{}' to module '{}' or fix start_stage",
                    m.start_stage, m.name
                ))
            })
            .collect()
    }
}

struct RedirectTargetExistsRule;
impl LintRule for RedirectTargetExistsRule {
    fn name(&self) -> &str { "redirect_target_exists" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (key, def) in catalog.stage_definitions() {
            for redirect in &def.redirects {
                let target = redirect.next_stage_definition.resolve(&key.module);
                if catalog.stage_definition(&target).is_err() {
                    diags.push(
                        Diagnostic::error(
                            self.name(),
                            key.to_string(),
                            "next_stage_definition",
                            format!("redirect from {} targets unknown stage definition {}", key, target),
                        )
                        .with_fix(format!("Add stage definition {} or fix next_stage_definition", target)),
                    );
                }
            }
        }
        diags
    }
}

struct RedirectSameModuleRule;
impl LintRule for RedirectSameModuleRule {
    fn name(&self) -> &str { "redirect_same_module" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (key, def) in catalog.stage_definitions() {
            for redirect in &def.redirects {
                if let Err(EryError::Validation { field, message, .. }) = redirect.clean(&key) {
                    diags.push(Diagnostic::error(self.name(), key.to_string(), &field, message));
                }
            }
        }
        diags
    }
}

struct RedirectConditionExistsRule;
impl LintRule for RedirectConditionExistsRule {
    fn name(&self) -> &str { "redirect_condition_exists" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for module in catalog.modules() {
            for def in &module.stage_definitions {
                for redirect in &def.redirects {
                    let Some(condition) = &redirect.condition else { continue };
                    if !has_condition(module, condition) {
                        diags.push(
                            Diagnostic::error(
                                self.name(),
                                StageKey::new(&module.name, &def.name).to_string(),
                                "condition",
                                format!(
                                    "redirect (order {}) uses unknown condition '{}'",
                                    redirect.order, condition
                                ),
                            )
                            .with_fix(format!("Add condition '{}' or fix the redirect's condition", condition)),
                        );
                    }
                }
            }
        }
        diags
    }
}

struct RedirectOrderUniqueRule;
impl LintRule for RedirectOrderUniqueRule {
    fn name(&self) -> &str { "redirect_order_unique" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (key, def) in catalog.stage_definitions() {
            let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
            for redirect in &def.redirects {
                *counts.entry(redirect.order).or_default() += 1;
            }
            for (order, count) in counts.into_iter().filter(|(_, c)| *c > 1) {
                diags.push(
                    Diagnostic::warning(
                        self.name(),
                        key.to_string(),
                        format!(
                            "{} redirects of {} share order {}; authoring order breaks the tie",
                            count, key, order
                        ),
                    )
                    .with_fix(format!("Change the order field of the redirects of {} that share order {}", key, order)),
                );
            }
        }
        diags
    }
}

struct StageTemplateTargetExistsRule;
impl LintRule for StageTemplateTargetExistsRule {
    fn name(&self) -> &str { "stage_template_target_exists" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (key, def) in catalog.stage_definitions() {
            for st in &def.stage_templates {
                if catalog.template(&st.template).is_err() {
                    diags.push(Diagnostic::error(
                        self.name(),
                        key.to_string(),
                        "stage_templates",
                        format!("stage template of {} uses unknown template '{}'", key, st.template),
                    ));
                }
            }
        }
        diags
    }
}

struct StageTemplateFrontendUniqueRule;
impl LintRule for StageTemplateFrontendUniqueRule {
    fn name(&self) -> &str { "stage_template_frontend_unique" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (key, def) in catalog.stage_definitions() {
            let mut seen = BTreeSet::new();
            for st in &def.stage_templates {
                let Ok(frontend) = catalog.stage_template_frontend(st) else { continue };
                if !seen.insert(frontend) {
                    diags.push(Diagnostic::error(
                        self.name(),
                        key.to_string(),
                        "stage_templates",
                        format!(
                            "StageDefinition: {}, contains more than one template with frontend: {}",
                            key, frontend
                        ),
                    ));
                }
            }
        }
        diags
    }
}

struct StageTemplatePresentRule;
impl LintRule for StageTemplatePresentRule {
    fn name(&self) -> &str { "stage_template_present" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        catalog
            .stage_definitions()
            .filter(|(_, def)| def.stage_templates.is_empty())
            .map(|(key, _)| {
                Diagnostic::warning(
                    self.name(),
                    key.to_string(),
                    format!("{} has no stage templates and cannot be rendered", key),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Rules: templates
// ---------------------------------------------------------------------------

struct TemplateParentExistsRule;
impl LintRule for TemplateParentExistsRule {
    fn name(&self) -> &str { "template_parent_exists" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        catalog
            .templates()
            .filter_map(|t| {
                let parent = t.parental_template.as_ref()?;
                catalog.template(parent).is_err().then(|| {
                    Diagnostic::error(
                        self.name(),
                        format!("Template '{}'", t.name),
                        "parental_template",
                        format!("parent '{}' of template {} does not exist", parent, t.name),
                    )
                })
            })
            .collect()
    }
}

struct TemplateNotCircularRule;
impl LintRule for TemplateNotCircularRule {
    fn name(&self) -> &str { "template_not_circular" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for template in catalog.templates() {
            let mut seen = BTreeSet::new();
            let mut cursor = Some(template);
            while let Some(t) = cursor {
                if !seen.insert(t.name.as_str()) {
                    diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Template '{}'", template.name),
                            "parental_template",
                            format!("template chain of {} is circular at {}", template.name, t.name),
                        )
                        .with_fix(format!("Change parental_template of '{}' to break the chain", t.name)),
                    );
                    break;
                }
                cursor = t
                    .parental_template
                    .as_deref()
                    .and_then(|p| catalog.template(p).ok());
            }
        }
        diags
    }
}

struct TemplateFrontendMatchesParentRule;
impl LintRule for TemplateFrontendMatchesParentRule {
    fn name(&self) -> &str { "template_frontend_matches_parent" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        catalog
            .templates()
            .filter_map(|t| {
                let parent = catalog.template(t.parental_template.as_deref()?).ok()?;
                (parent.frontend != t.frontend).then(|| {
                    Diagnostic::error(
                        self.name(),
                        format!("Template '{}'", t.name),
                        "parental_template",
                        format!(
                            "template {} uses frontend {} but its parent {} uses {}",
                            t.name, t.frontend, parent.name, parent.frontend
                        ),
                    )
                })
            })
            .collect()
    }
}

struct RootTemplateSingleBlockRule;
impl LintRule for RootTemplateSingleBlockRule {
    fn name(&self) -> &str { "root_template_single_block" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        catalog
            .templates()
            .filter(|t| t.is_root() && t.blocks.len() > 1)
            .map(|t| {
                Diagnostic::error(
                    self.name(),
                    format!("Template '{}'", t.name),
                    "parental_template",
                    format!(
                        "Since template: {}, has more than one template_block, it must have a parental_template",
                        t.name
                    ),
                )
                .with_fix(format!(
                    "Set parental_template on '{}' or move its extra template_blocks into a child template",
                    t.name
                ))
            })
            .collect()
    }
}

struct TemplateReadyRule;
impl LintRule for TemplateReadyRule {
    fn name(&self) -> &str { "template_ready" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        catalog
            .templates()
            .filter_map(|t| {
                let err = template_readiness(catalog, &t.name, &t.primary_language).err()?;
                // Broken chains are reported by the template rules above.
                matches!(err, EryError::Validation { ref field, .. } if field == "blocks").then(|| {
                    Diagnostic::warning(
                        self.name(),
                        format!("Template '{}'", t.name),
                        format!(
                            "template {} is not ready in {}: {}",
                            t.name,
                            t.primary_language,
                            validation_message(&err)
                        ),
                    )
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Rules: conditions and actions
// ---------------------------------------------------------------------------

struct ConditionReferencesRule;
impl LintRule for ConditionReferencesRule {
    fn name(&self) -> &str { "condition_references" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for module in catalog.modules() {
            let names: BTreeSet<&str> = module.conditions.iter().map(|c| c.name.as_str()).collect();
            for condition in &module.conditions {
                let location = format!("Condition '{}' of module '{}'", condition.name, module.name);
                for (side, operand) in [("left", &condition.left), ("right", &condition.right)] {
                    match operand {
                        Operand::Variable(name) if module.variable(name).is_none() => {
                            diags.push(Diagnostic::error(
                                self.name(),
                                location.clone(),
                                &format!("{}_variable_definition", side),
                                format!("unknown variable '{}'", name),
                            ));
                        }
                        Operand::SubCondition(name) if !names.contains(name.as_str()) => {
                            diags.push(Diagnostic::error(
                                self.name(),
                                location.clone(),
                                &format!("{}_sub_condition", side),
                                format!("unknown sub condition '{}'", name),
                            ));
                        }
                        _ => {}
                    }
                }
            }
        }
        diags
    }
}

struct ConditionAcyclicRule;
impl LintRule for ConditionAcyclicRule {
    fn name(&self) -> &str { "condition_acyclic" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for module in catalog.modules() {
            let cycles = sub_condition_cycles(&module.conditions);
            for condition in &module.conditions {
                let Some(path) = cycles.get(condition.name.as_str()) else { continue };
                let next = path.get(1).map(String::as_str).unwrap_or_default();
                let field = match &condition.left {
                    Operand::SubCondition(name) if name == next => "left_sub_condition",
                    _ => "right_sub_condition",
                };
                let err = EryError::ConditionCycle {
                    condition: condition.name.clone(),
                    path: path.join(" -> "),
                };
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Condition '{}' of module '{}'", condition.name, module.name),
                        field,
                        err.to_string(),
                    )
                    .with_fix(format!(
                        "Point {} of '{}' at a condition that does not lead back to '{}'",
                        field, condition.name, condition.name
                    )),
                );
            }
        }
        diags
    }
}

struct PreActionExistsRule;
impl LintRule for PreActionExistsRule {
    fn name(&self) -> &str { "pre_action_exists" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for module in catalog.modules() {
            for def in &module.stage_definitions {
                if let Some(action) = &def.pre_action {
                    if module.action(action).is_none() {
                        diags.push(Diagnostic::error(
                            self.name(),
                            StageKey::new(&module.name, &def.name).to_string(),
                            "pre_action",
                            format!("pre action '{}' does not exist", action),
                        ));
                    }
                }
            }
            for action in &module.actions {
                let location = format!("Action '{}' of module '{}'", action.name, module.name);
                for step in &action.steps {
                    if let Some(condition) = &step.condition {
                        if !has_condition(module, condition) {
                            diags.push(Diagnostic::error(
                                self.name(),
                                location.clone(),
                                "condition",
                                format!("step {} uses unknown condition '{}'", step.order, condition),
                            ));
                        }
                    }
                    let problem = match &step.kind {
                        ActionKind::SetVariable { variable, .. } if module.variable(variable).is_none() => {
                            Some(("variable", format!("step {} sets unknown variable '{}'", step.order, variable)))
                        }
                        ActionKind::Subaction { action: sub } if module.action(sub).is_none() => {
                            Some(("action", format!("step {} runs unknown action '{}'", step.order, sub)))
                        }
                        _ => None,
                    };
                    if let Some((field, message)) = problem {
                        diags.push(Diagnostic::error(self.name(), location.clone(), field, message));
                    }
                }
            }
        }
        diags
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for module in catalog.modules() {
            if module.stage_definition(&module.start_stage).is_none() {
                continue; // reported by start_stage
            }
            let mut visited = BTreeSet::new();
            let mut queue = VecDeque::new();
            visited.insert(module.start_stage.clone());
            queue.push_back(module.start_stage.clone());

            while let Some(current) = queue.pop_front() {
                let Some(def) = module.stage_definition(&current) else { continue };
                for redirect in &def.redirects {
                    let target = redirect.next_stage_definition.resolve(&module.name);
                    if target.module == module.name && visited.insert(target.stage.clone()) {
                        queue.push_back(target.stage);
                    }
                }
            }

            for def in module.stage_definitions.iter().filter(|d| !visited.contains(&d.name)) {
                let key = StageKey::new(&module.name, &def.name);
                diags.push(
                    Diagnostic::warning(
                        self.name(),
                        key.to_string(),
                        format!("{} is not reachable from start stage {}", key, module.start_stage),
                    )
                    .with_fix(format!("Add a redirect leading to '{}' or remove it", def.name)),
                );
            }
        }
        diags
    }
}

struct EndStagePresentRule;
impl LintRule for EndStagePresentRule {
    fn name(&self) -> &str { "end_stage_present" }
    fn apply(&self, catalog: &Catalog) -> Vec<Diagnostic> {
        catalog
            .modules()
            .filter(|m| !m.stage_definitions.iter().any(|d| d.end_stage))
            .map(|m| {
                Diagnostic::warning(
                    self.name(),
                    format!("ModuleDefinition '{}'", m.name),
                    format!("module '{}' has no end stage; hands can never finish", m.name),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn has_condition(module: &ModuleDefinition, name: &str) -> bool {
    module.conditions.iter().any(|c| c.name == name)
}

fn validation_message(err: &EryError) -> String {
    match err {
        EryError::Validation { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(catalog: &Catalog) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(StartStageRule),
        Box::new(RedirectTargetExistsRule),
        Box::new(RedirectSameModuleRule),
        Box::new(RedirectConditionExistsRule),
        Box::new(RedirectOrderUniqueRule),
        Box::new(StageTemplateTargetExistsRule),
        Box::new(StageTemplateFrontendUniqueRule),
        Box::new(StageTemplatePresentRule),
        Box::new(TemplateParentExistsRule),
        Box::new(TemplateNotCircularRule),
        Box::new(TemplateFrontendMatchesParentRule),
        Box::new(RootTemplateSingleBlockRule),
        Box::new(ConditionReferencesRule),
        Box::new(ConditionAcyclicRule),
        Box::new(PreActionExistsRule),
        Box::new(ReachabilityRule),
        Box::new(EndStagePresentRule),
        Box::new(TemplateReadyRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(catalog));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic is found.
///
/// The error is scoped to the first failing object and field and carries every
/// error message.
pub fn validate_or_raise(catalog: &Catalog) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(catalog);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if let Some(first) = errors.first() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(EryError::validation(
            first.location.clone().unwrap_or_else(|| "Catalog".into()),
            first.field.clone().unwrap_or_else(|| first.rule.clone()),
            messages.join("; "),
        ));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
