//! Authoring model: templates, module definitions, stage definitions and redirects.
//!
//! A [`Catalog`] is loaded from a JSON [`CatalogDocument`] and indexed by name.
//! Authoring operations validate before they mutate, so a failed call leaves the
//! catalog unchanged.

use std::collections::BTreeMap;
use std::fmt;

use ery_types::{EryError, NotFoundKind, Result};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::condition::{sub_condition_cycles, Condition, ConditionRecord, ConditionSource};

/// Name automatically given to the single block of a root template.
pub const ROOT_BLOCK_NAME: &str = "Root";

// ---------------------------------------------------------------------------
// Keys and references
// ---------------------------------------------------------------------------

/// Identifies a stage definition inside the catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageKey {
    pub module: String,
    pub stage: String,
}

impl StageKey {
    pub fn new(module: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            stage: stage.into(),
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.stage)
    }
}

/// Textual redirect target: `"Stage"` (owning module) or `"module/Stage"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageRef {
    pub module: Option<String>,
    pub stage: String,
}

impl StageRef {
    pub fn local(stage: impl Into<String>) -> Self {
        Self {
            module: None,
            stage: stage.into(),
        }
    }

    pub fn qualified(module: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            stage: stage.into(),
        }
    }

    /// Resolve against the module that owns the redirect.
    pub fn resolve(&self, owner_module: &str) -> StageKey {
        StageKey::new(
            self.module.as_deref().unwrap_or(owner_module),
            self.stage.clone(),
        )
    }
}

impl TryFrom<String> for StageRef {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let parts: Vec<&str> = value.split('/').collect();
        match parts.as_slice() {
            [stage] if !stage.is_empty() => Ok(StageRef::local(*stage)),
            [module, stage] if !module.is_empty() && !stage.is_empty() => {
                Ok(StageRef::qualified(*module, *stage))
            }
            _ => Err(format!("invalid stage reference '{}'", value)),
        }
    }
}

impl From<StageRef> for String {
    fn from(value: StageRef) -> Self {
        match value.module {
            Some(module) => format!("{}/{}", module, value.stage),
            None => value.stage,
        }
    }
}

impl fmt::Display for StageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{}/{}", module, self.stage),
            None => f.write_str(&self.stage),
        }
    }
}

// ---------------------------------------------------------------------------
// Templates and blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTranslation {
    pub language: String,
    #[serde(default)]
    pub content: String,
}

/// A named piece of content with per-language translations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub name: String,
    #[serde(default)]
    pub translations: Vec<BlockTranslation>,
}

impl ContentBlock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            translations: Vec::new(),
        }
    }

    pub fn with_translation(mut self, language: impl Into<String>, content: impl Into<String>) -> Self {
        self.translations.push(BlockTranslation {
            language: language.into(),
            content: content.into(),
        });
        self
    }

    pub fn translation(&self, language: &str) -> Option<&BlockTranslation> {
        self.translations.iter().find(|t| t.language == language)
    }
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub frontend: String,
    #[serde(default)]
    pub parental_template: Option<String>,
    #[serde(default = "default_language")]
    pub primary_language: String,
    #[serde(default)]
    pub blocks: Vec<ContentBlock>,
}

impl Template {
    pub fn new(name: impl Into<String>, frontend: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frontend: frontend.into(),
            parental_template: None,
            primary_language: default_language(),
            blocks: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parental_template.is_none()
    }
}

/// Binds a stage definition to a template for the template's frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTemplate {
    pub template: String,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub blocks: Vec<ContentBlock>,
}

impl StageTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            theme: None,
            blocks: Vec::new(),
        }
    }

    pub fn with_block(mut self, block: ContentBlock) -> Self {
        self.blocks.push(block);
        self
    }
}

// ---------------------------------------------------------------------------
// Stage definitions and redirects
// ---------------------------------------------------------------------------

/// Breadcrumb retention policy of a stage definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreadcrumbType {
    None,
    Back,
    #[default]
    All,
}

impl BreadcrumbType {
    /// Whether a crumb of this type may point forward to a later crumb.
    pub fn links_forward(self) -> bool {
        self == BreadcrumbType::All
    }

    /// Whether a crumb of this type may point back to an earlier crumb.
    pub fn links_backward(self) -> bool {
        matches!(self, BreadcrumbType::Back | BreadcrumbType::All)
    }
}

impl fmt::Display for BreadcrumbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreadcrumbType::None => "none",
            BreadcrumbType::Back => "back",
            BreadcrumbType::All => "all",
        })
    }
}

/// A guarded, ordered edge to another stage definition of the same module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redirect {
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub condition: Option<String>,
    pub next_stage_definition: StageRef,
}

impl Redirect {
    pub fn new(order: i64, next_stage_definition: StageRef) -> Self {
        Self {
            order,
            condition: None,
            next_stage_definition,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Rejects redirects that leave the owning module.
    pub fn clean(&self, from: &StageKey) -> Result<()> {
        let target = self.next_stage_definition.resolve(&from.module);
        if target.module != from.module {
            return Err(EryError::validation(
                format!("Redirect from {}", from),
                "next_stage_definition",
                format!(
                    "Redirect for {} cannot connect to a different ModuleDefinition than {}",
                    from, from.module
                ),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub breadcrumb_type: BreadcrumbType,
    #[serde(default)]
    pub end_stage: bool,
    #[serde(default = "default_true")]
    pub redirect_on_submit: bool,
    #[serde(default)]
    pub pre_action: Option<String>,
    #[serde(default)]
    pub redirects: Vec<Redirect>,
    #[serde(default)]
    pub stage_templates: Vec<StageTemplate>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            breadcrumb_type: BreadcrumbType::default(),
            end_stage: false,
            redirect_on_submit: true,
            pre_action: None,
            redirects: Vec::new(),
            stage_templates: Vec::new(),
        }
    }

    pub fn with_breadcrumb_type(mut self, breadcrumb_type: BreadcrumbType) -> Self {
        self.breadcrumb_type = breadcrumb_type;
        self
    }

    pub fn end_stage(mut self) -> Self {
        self.end_stage = true;
        self
    }

    pub fn with_redirect(mut self, redirect: Redirect) -> Self {
        self.redirects.push(redirect);
        self
    }

    pub fn with_pre_action(mut self, action: impl Into<String>) -> Self {
        self.pre_action = Some(action.into());
        self
    }

    pub fn with_stage_template(mut self, stage_template: StageTemplate) -> Self {
        self.stage_templates.push(stage_template);
        self
    }
}

// ---------------------------------------------------------------------------
// Module definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default)]
    pub default: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub name: String,
    pub start_stage: String,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub stage_definitions: Vec<StageDefinition>,
}

impl ModuleDefinition {
    pub fn new(name: impl Into<String>, start_stage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_stage: start_stage.into(),
            variables: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            stage_definitions: Vec::new(),
        }
    }

    pub fn stage_definition(&self, name: &str) -> Option<&StageDefinition> {
        self.stage_definitions.iter().find(|s| s.name == name)
    }

    fn stage_definition_mut(&mut self, name: &str) -> Option<&mut StageDefinition> {
        self.stage_definitions.iter_mut().find(|s| s.name == name)
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDefinition> {
        self.variables.iter().find(|v| v.name == name)
    }
}

impl ConditionSource for ModuleDefinition {
    fn condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.name == name)
    }
}

// ---------------------------------------------------------------------------
// CatalogDocument / Catalog
// ---------------------------------------------------------------------------

/// Serialized form of a catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub modules: Vec<ModuleDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    templates: BTreeMap<String, Template>,
    modules: BTreeMap<String, ModuleDefinition>,
}

fn check_unique<'a>(object: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(EryError::validation(
                object,
                "name",
                format!("duplicate name '{}'", name),
            ));
        }
    }
    Ok(())
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON catalog document.
    pub fn from_json(json: &str) -> Result<Self> {
        let document: CatalogDocument = serde_json::from_str(json)?;
        Self::from_document(document)
    }

    /// Index a document by name. Names must be unique per scope.
    pub fn from_document(document: CatalogDocument) -> Result<Self> {
        check_unique("Template", document.templates.iter().map(|t| t.name.as_str()))?;
        check_unique("ModuleDefinition", document.modules.iter().map(|m| m.name.as_str()))?;
        for module in &document.modules {
            let object = format!("ModuleDefinition '{}'", module.name);
            check_unique(&object, module.stage_definitions.iter().map(|s| s.name.as_str()))?;
            check_unique(&object, module.conditions.iter().map(|c| c.name.as_str()))?;
            check_unique(&object, module.actions.iter().map(|a| a.name.as_str()))?;
            check_unique(&object, module.variables.iter().map(|v| v.name.as_str()))?;
        }

        let templates = document
            .templates
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        let modules = document
            .modules
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();

        Ok(Self { templates, modules })
    }

    pub fn to_document(&self) -> CatalogDocument {
        CatalogDocument {
            templates: self.templates.values().cloned().collect(),
            modules: self.modules.values().cloned().collect(),
        }
    }

    // --- Lookups ---

    pub fn templates(&self) -> impl Iterator<Item = &Template> {
        self.templates.values()
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleDefinition> {
        self.modules.values()
    }

    pub fn template(&self, name: &str) -> Result<&Template> {
        self.templates.get(name).ok_or_else(|| {
            EryError::not_found(NotFoundKind::Template, format!("no template named '{}'", name))
        })
    }

    pub fn module(&self, name: &str) -> Result<&ModuleDefinition> {
        self.modules.get(name).ok_or_else(|| {
            EryError::not_found(NotFoundKind::Module, format!("no module named '{}'", name))
        })
    }

    pub fn stage_definition(&self, key: &StageKey) -> Result<&StageDefinition> {
        self.module(&key.module)?
            .stage_definition(&key.stage)
            .ok_or_else(|| {
                EryError::not_found(
                    NotFoundKind::StageDefinition,
                    format!("no stage definition '{}'", key),
                )
            })
    }

    /// Every stage definition in the catalog with its key.
    pub fn stage_definitions(&self) -> impl Iterator<Item = (StageKey, &StageDefinition)> {
        self.modules.values().flat_map(|m| {
            m.stage_definitions
                .iter()
                .map(move |s| (StageKey::new(&m.name, &s.name), s))
        })
    }

    /// Keys of the stage definitions with a redirect targeting `key`.
    pub fn redirect_sources(&self, key: &StageKey) -> Vec<StageKey> {
        self.stage_definitions()
            .filter(|(from, def)| {
                def.redirects
                    .iter()
                    .any(|r| &r.next_stage_definition.resolve(&from.module) == key)
            })
            .map(|(from, _)| from)
            .collect()
    }

    /// Frontend served by a stage template (its template's frontend).
    pub fn stage_template_frontend(&self, stage_template: &StageTemplate) -> Result<&str> {
        Ok(self.template(&stage_template.template)?.frontend.as_str())
    }

    // --- Authoring operations ---

    pub fn add_template(&mut self, template: Template) -> Result<()> {
        if self.templates.contains_key(&template.name) {
            return Err(EryError::validation(
                format!("Template '{}'", template.name),
                "name",
                "a template with this name already exists",
            ));
        }
        let name = template.name.clone();
        let parent = template.parental_template.clone();
        let blocks = template.blocks.clone();
        self.templates.insert(
            name.clone(),
            Template {
                parental_template: None,
                blocks: Vec::new(),
                ..template
            },
        );
        let result = self
            .set_parental_template(&name, parent.as_deref())
            .and_then(|_| {
                blocks
                    .into_iter()
                    .try_for_each(|block| self.add_template_block(&name, block))
            });
        if result.is_err() {
            self.templates.remove(&name);
        }
        result
    }

    pub fn add_module(&mut self, module: ModuleDefinition) -> Result<()> {
        if self.modules.contains_key(&module.name) {
            return Err(EryError::validation(
                format!("ModuleDefinition '{}'", module.name),
                "name",
                "a module with this name already exists",
            ));
        }
        self.modules.insert(module.name.clone(), module);
        Ok(())
    }

    pub fn add_stage_definition(&mut self, module: &str, definition: StageDefinition) -> Result<()> {
        let key = StageKey::new(module, &definition.name);
        let m = self.module_mut(module)?;
        if m.stage_definition(&definition.name).is_some() {
            return Err(EryError::validation(
                format!("StageDefinition {}", key),
                "name",
                "a stage definition with this name already exists",
            ));
        }
        m.stage_definitions.push(StageDefinition {
            redirects: Vec::new(),
            stage_templates: Vec::new(),
            ..definition.clone()
        });
        let result = definition
            .redirects
            .into_iter()
            .try_for_each(|r| self.add_redirect(&key, r))
            .and_then(|_| {
                definition
                    .stage_templates
                    .into_iter()
                    .try_for_each(|st| self.add_stage_template(&key, st))
            });
        if result.is_err() {
            if let Ok(m) = self.module_mut(module) {
                m.stage_definitions.retain(|s| s.name != key.stage);
            }
        }
        result
    }

    /// Add a redirect to `from`. The target must be a stage definition of the same module.
    pub fn add_redirect(&mut self, from: &StageKey, redirect: Redirect) -> Result<()> {
        self.stage_definition(from)?;
        redirect.clean(from)?;
        let target = redirect.next_stage_definition.resolve(&from.module);
        self.stage_definition(&target)?;
        if let Some(condition) = &redirect.condition {
            if self.module(&from.module)?.condition(condition).is_none() {
                return Err(EryError::not_found(
                    NotFoundKind::Condition,
                    format!("redirect from {} uses unknown condition '{}'", from, condition),
                ));
            }
        }
        self.stage_definition_mut(from)?.redirects.push(redirect);
        tracing::debug!(from = %from, to = %target, "redirect added");
        Ok(())
    }

    /// Attach a stage template. A stage definition holds at most one per frontend.
    pub fn add_stage_template(&mut self, key: &StageKey, stage_template: StageTemplate) -> Result<()> {
        let frontend = self.stage_template_frontend(&stage_template)?.to_string();
        let definition = self.stage_definition(key)?;
        for existing in &definition.stage_templates {
            if self.stage_template_frontend(existing).ok() == Some(frontend.as_str()) {
                return Err(EryError::validation(
                    format!("StageDefinition {}", key),
                    "stage_templates",
                    format!(
                        "StageDefinition: {}, contains more than one template with frontend: {}",
                        key, frontend
                    ),
                ));
            }
        }
        self.stage_definition_mut(key)?
            .stage_templates
            .push(stage_template);
        Ok(())
    }

    /// Set or clear a template's parent, rejecting cycles and frontend mismatches.
    pub fn set_parental_template(&mut self, name: &str, parent: Option<&str>) -> Result<()> {
        let template = self.template(name)?;
        let object = format!("Template '{}'", name);

        match parent {
            Some(parent_name) => {
                let parent_template = self.template(parent_name)?;
                // Walk up from the proposed parent; reaching `name` closes a loop.
                let mut cursor = Some(parent_template);
                let mut steps = 0;
                while let Some(t) = cursor {
                    if t.name == name || steps > self.templates.len() {
                        return Err(EryError::validation(
                            object,
                            "parental_template",
                            format!(
                                "Can not set specified parent of {} as it leads to a circular reference",
                                name
                            ),
                        ));
                    }
                    steps += 1;
                    cursor = t
                        .parental_template
                        .as_deref()
                        .and_then(|p| self.templates.get(p));
                }
                if parent_template.frontend != template.frontend {
                    return Err(EryError::validation(
                        object,
                        "parental_template",
                        format!(
                            "Can not set specified parent {} of {} as it uses frontend {} and the current template uses {}",
                            parent_name, name, parent_template.frontend, template.frontend
                        ),
                    ));
                }
            }
            None => {
                if template.blocks.len() > 1 {
                    return Err(EryError::validation(
                        object,
                        "parental_template",
                        format!(
                            "Since template: {}, has more than one template_block, it must have a parental_template",
                            name
                        ),
                    ));
                }
            }
        }

        let template = self.template_mut(name)?;
        template.parental_template = parent.map(String::from);
        if template.is_root() {
            if let Some(block) = template.blocks.first_mut() {
                block.name = ROOT_BLOCK_NAME.to_string();
            }
        }
        Ok(())
    }

    /// Add a block to a template. A root template holds a single block named `Root`.
    pub fn add_template_block(&mut self, name: &str, mut block: ContentBlock) -> Result<()> {
        let template = self.template_mut(name)?;
        let object = format!("Template '{}'", name);
        if template.is_root() {
            if !template.blocks.is_empty() {
                return Err(EryError::validation(
                    object,
                    "parental_template",
                    format!(
                        "Since template: {}, has more than one template_block, it must have a parental_template",
                        name
                    ),
                ));
            }
            block.name = ROOT_BLOCK_NAME.to_string();
        } else if template.blocks.iter().any(|b| b.name == block.name) {
            return Err(EryError::validation(
                object,
                "blocks",
                format!("block '{}' already exists", block.name),
            ));
        }
        template.blocks.push(block);
        Ok(())
    }

    /// Insert or replace a condition after validating it and its sub-condition graph.
    pub fn insert_condition(&mut self, module: &str, record: ConditionRecord) -> Result<()> {
        let condition = Condition::try_from(record)?;
        let mut scratch = self.module(module)?.clone();
        match scratch.conditions.iter_mut().find(|c| c.name == condition.name) {
            Some(existing) => *existing = condition.clone(),
            None => scratch.conditions.push(condition.clone()),
        }
        if let Some(missing) = condition.sub_conditions().find(|n| scratch.condition(n).is_none()) {
            return Err(EryError::not_found(
                NotFoundKind::Condition,
                format!("no condition named '{}'", missing),
            ));
        }
        if let Some(path) = sub_condition_cycles(&scratch.conditions).get(condition.name.as_str()) {
            return Err(EryError::ConditionCycle {
                condition: condition.name.clone(),
                path: path.join(" -> "),
            });
        }

        self.modules.insert(module.to_string(), scratch);
        Ok(())
    }

    /// Remove a stage definition and every redirect that targets it.
    ///
    /// Runtime state (stages, breadcrumbs) is handled by the flow engine.
    pub fn remove_stage_definition(&mut self, key: &StageKey) -> Result<StageDefinition> {
        self.stage_definition(key)?;
        let mut removed_redirects = 0;
        for module in self.modules.values_mut() {
            let module_name = module.name.clone();
            for definition in &mut module.stage_definitions {
                let before = definition.redirects.len();
                definition
                    .redirects
                    .retain(|r| &r.next_stage_definition.resolve(&module_name) != key);
                removed_redirects += before - definition.redirects.len();
            }
        }
        let module = self.module_mut(&key.module)?;
        let index = module
            .stage_definitions
            .iter()
            .position(|s| s.name == key.stage)
            .ok_or_else(|| {
                EryError::not_found(NotFoundKind::StageDefinition, format!("no stage definition '{}'", key))
            })?;
        let removed = module.stage_definitions.remove(index);
        tracing::info!(stage = %key, removed_redirects, "stage definition removed");
        Ok(removed)
    }

    // --- Mutable lookups ---

    fn module_mut(&mut self, name: &str) -> Result<&mut ModuleDefinition> {
        self.modules.get_mut(name).ok_or_else(|| {
            EryError::not_found(NotFoundKind::Module, format!("no module named '{}'", name))
        })
    }

    fn template_mut(&mut self, name: &str) -> Result<&mut Template> {
        self.templates.get_mut(name).ok_or_else(|| {
            EryError::not_found(NotFoundKind::Template, format!("no template named '{}'", name))
        })
    }

    fn stage_definition_mut(&mut self, key: &StageKey) -> Result<&mut StageDefinition> {
        self.module_mut(&key.module)?
            .stage_definition_mut(&key.stage)
            .ok_or_else(|| {
                EryError::not_found(
                    NotFoundKind::StageDefinition,
                    format!("no stage definition '{}'", key),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        let mut catalog = Catalog::new();
        catalog.add_template(Template::new("Base", "Web")).unwrap();
        catalog.add_template(Template::new("Sms", "SMS")).unwrap();
        catalog
            .add_module(ModuleDefinition::new("survey", "Intro"))
            .unwrap();
        catalog
            .add_module(ModuleDefinition::new("other", "Start"))
            .unwrap();
        catalog
            .add_stage_definition("survey", StageDefinition::new("Intro"))
            .unwrap();
        catalog
            .add_stage_definition("survey", StageDefinition::new("Outro"))
            .unwrap();
        catalog
            .add_stage_definition("other", StageDefinition::new("Start"))
            .unwrap();
        catalog
    }

    #[test]
    fn stage_ref_parses_local_and_qualified() {
        let local: StageRef = serde_json::from_str("\"Intro\"").unwrap();
        assert_eq!(local, StageRef::local("Intro"));
        let qualified: StageRef = serde_json::from_str("\"other/Start\"").unwrap();
        assert_eq!(qualified.resolve("survey"), StageKey::new("other", "Start"));
        assert!(serde_json::from_str::<StageRef>("\"a/b/c\"").is_err());
        assert!(serde_json::from_str::<StageRef>("\"\"").is_err());
    }

    #[test]
    fn add_redirect_within_module() {
        let mut catalog = catalog();
        let from = StageKey::new("survey", "Intro");
        catalog
            .add_redirect(&from, Redirect::new(1, StageRef::local("Outro")))
            .unwrap();
        assert_eq!(catalog.stage_definition(&from).unwrap().redirects.len(), 1);
        assert_eq!(
            catalog.redirect_sources(&StageKey::new("survey", "Outro")),
            vec![from]
        );
    }

    #[test]
    fn add_redirect_rejects_other_module() {
        let mut catalog = catalog();
        let from = StageKey::new("survey", "Intro");
        let err = catalog
            .add_redirect(&from, Redirect::new(1, StageRef::qualified("other", "Start")))
            .unwrap_err();
        match err {
            EryError::Validation { field, .. } => assert_eq!(field, "next_stage_definition"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(catalog.stage_definition(&from).unwrap().redirects.is_empty());
    }

    #[test]
    fn add_redirect_rejects_unknown_target() {
        let mut catalog = catalog();
        let err = catalog
            .add_redirect(
                &StageKey::new("survey", "Intro"),
                Redirect::new(1, StageRef::local("Missing")),
            )
            .unwrap_err();
        assert_eq!(err.not_found_kind(), Some(NotFoundKind::StageDefinition));
    }

    #[test]
    fn stage_template_frontend_unique() {
        let mut catalog = catalog();
        catalog.add_template(Template::new("Base2", "Web")).unwrap();
        let key = StageKey::new("survey", "Intro");
        catalog
            .add_stage_template(&key, StageTemplate::new("Base"))
            .unwrap();
        catalog
            .add_stage_template(&key, StageTemplate::new("Sms"))
            .unwrap();
        let err = catalog
            .add_stage_template(&key, StageTemplate::new("Base2"))
            .unwrap_err();
        assert!(err.to_string().contains("more than one template with frontend: Web"));
        assert_eq!(catalog.stage_definition(&key).unwrap().stage_templates.len(), 2);
    }

    #[test]
    fn parental_template_cycle_rejected() {
        let mut catalog = catalog();
        catalog.add_template(Template::new("Child", "Web")).unwrap();
        catalog.set_parental_template("Child", Some("Base")).unwrap();
        let err = catalog.set_parental_template("Base", Some("Child")).unwrap_err();
        assert!(err.to_string().contains("circular"));
        let err = catalog.set_parental_template("Base", Some("Base")).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn parental_template_frontend_must_match() {
        let mut catalog = catalog();
        let err = catalog.set_parental_template("Sms", Some("Base")).unwrap_err();
        match err {
            EryError::Validation { field, message, .. } => {
                assert_eq!(field, "parental_template");
                assert!(message.contains("frontend"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn root_template_holds_single_root_block() {
        let mut catalog = catalog();
        catalog
            .add_template_block("Base", ContentBlock::new("Layout").with_translation("en", "<main/>"))
            .unwrap();
        assert_eq!(catalog.template("Base").unwrap().blocks[0].name, ROOT_BLOCK_NAME);
        let err = catalog
            .add_template_block("Base", ContentBlock::new("Second"))
            .unwrap_err();
        assert!(matches!(err, EryError::Validation { .. }));
    }

    #[test]
    fn child_templates_hold_many_blocks() {
        let mut catalog = catalog();
        let mut child = Template::new("Child", "Web");
        child.parental_template = Some("Base".into());
        child.blocks = vec![ContentBlock::new("Header"), ContentBlock::new("Footer")];
        catalog.add_template(child).unwrap();
        assert_eq!(catalog.template("Child").unwrap().blocks.len(), 2);

        let err = catalog.set_parental_template("Child", None).unwrap_err();
        assert!(err.to_string().contains("must have a parental_template"));
    }

    #[test]
    fn failed_add_template_leaves_catalog_unchanged() {
        let mut catalog = catalog();
        let mut bad = Template::new("Bad", "Web");
        bad.parental_template = Some("Sms".into());
        assert!(catalog.add_template(bad).is_err());
        assert!(catalog.template("Bad").is_err());
    }

    #[test]
    fn remove_stage_definition_cascades_redirects() {
        let mut catalog = catalog();
        let intro = StageKey::new("survey", "Intro");
        let outro = StageKey::new("survey", "Outro");
        catalog
            .add_redirect(&intro, Redirect::new(1, StageRef::local("Outro")))
            .unwrap();
        let removed = catalog.remove_stage_definition(&outro).unwrap();
        assert_eq!(removed.name, "Outro");
        assert!(catalog.stage_definition(&intro).unwrap().redirects.is_empty());
        assert!(catalog.stage_definition(&outro).is_err());
    }

    #[test]
    fn from_json_rejects_duplicate_names() {
        let json = r#"{
            "modules": [
                {"name": "m", "start_stage": "A",
                 "stage_definitions": [{"name": "A"}, {"name": "A"}]}
            ]
        }"#;
        let err = Catalog::from_json(json).unwrap_err();
        assert!(err.to_string().contains("duplicate name 'A'"));
    }

    #[test]
    fn from_json_applies_defaults() {
        let json = r#"{
            "templates": [{"name": "Base", "frontend": "Web"}],
            "modules": [{"name": "m", "start_stage": "A", "stage_definitions": [{"name": "A"}]}]
        }"#;
        let catalog = Catalog::from_json(json).unwrap();
        let def = catalog.stage_definition(&StageKey::new("m", "A")).unwrap();
        assert_eq!(def.breadcrumb_type, BreadcrumbType::All);
        assert!(def.redirect_on_submit);
        assert!(!def.end_stage);
        assert_eq!(catalog.template("Base").unwrap().primary_language, "en");
    }

    #[test]
    fn breadcrumb_type_link_permissions() {
        assert!(BreadcrumbType::All.links_forward());
        assert!(!BreadcrumbType::Back.links_forward());
        assert!(BreadcrumbType::Back.links_backward());
        assert!(!BreadcrumbType::None.links_backward());
    }

    #[test]
    fn insert_condition_rejects_cycles_and_unknown_sub_conditions() {
        use crate::condition::{BinaryOperator, Operand, Relation};

        let mut catalog = catalog();
        let leaf = Condition::relation(
            "leaf",
            Operand::Expression("1".into()),
            Relation::Equal,
            Operand::Expression("1".into()),
        )
        .unwrap();
        catalog.insert_condition("survey", leaf.into()).unwrap();

        let join = |name: &str, left: &str, right: &str| -> ConditionRecord {
            Condition::operator(
                name,
                Operand::SubCondition(left.into()),
                BinaryOperator::And,
                Operand::SubCondition(right.into()),
            )
            .unwrap()
            .into()
        };

        let err = catalog.insert_condition("survey", join("a", "leaf", "ghost")).unwrap_err();
        assert!(matches!(err, EryError::NotFound { .. }));

        catalog.insert_condition("survey", join("a", "leaf", "leaf")).unwrap();
        catalog.insert_condition("survey", join("b", "a", "leaf")).unwrap();

        // Re-pointing `a` at `b` would close the loop a -> b -> a
        match catalog.insert_condition("survey", join("a", "b", "leaf")).unwrap_err() {
            EryError::ConditionCycle { condition, path } => {
                assert_eq!(condition, "a");
                assert_eq!(path, "a -> b -> a");
            }
            other => panic!("unexpected {:?}", other),
        }
        let module = catalog.module("survey").unwrap();
        assert_eq!(module.conditions.len(), 3);
        assert_eq!(
            module.condition("a").unwrap().sub_conditions().collect::<Vec<_>>(),
            vec!["leaf", "leaf"]
        );
    }
}
