//! Block resolution: merge stage-template overrides with the template ancestry chain.

use std::collections::BTreeMap;

use ery_types::{EryError, NotFoundKind, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, ContentBlock, StageKey, StageTemplate, Template};

// ---------------------------------------------------------------------------
// TemplateChain
// ---------------------------------------------------------------------------

/// One template of a chain with its distance from the leaf (leaf = 0).
#[derive(Debug, Clone, Copy)]
pub struct Generation<'a> {
    pub template: &'a Template,
    pub distance: usize,
}

/// A template and its ancestors, leaf first.
#[derive(Debug, Clone)]
pub struct TemplateChain<'a> {
    generations: Vec<Generation<'a>>,
}

impl<'a> TemplateChain<'a> {
    /// Walk `parental_template` from `leaf` to the root.
    pub fn build(catalog: &'a Catalog, leaf: &str) -> Result<Self> {
        let mut generations: Vec<Generation<'a>> = Vec::new();
        let mut cursor = Some(catalog.template(leaf)?);

        while let Some(template) = cursor {
            if generations.iter().any(|g| g.template.name == template.name) {
                return Err(EryError::validation(
                    format!("Template '{}'", leaf),
                    "parental_template",
                    format!("template chain of {} is circular at {}", leaf, template.name),
                ));
            }
            generations.push(Generation {
                template,
                distance: generations.len(),
            });
            cursor = match &template.parental_template {
                Some(parent) => Some(catalog.template(parent)?),
                None => None,
            };
        }

        Ok(Self { generations })
    }

    pub fn leaf(&self) -> &'a Template {
        self.generations[0].template
    }

    pub fn root(&self) -> &'a Template {
        self.generations[self.generations.len() - 1].template
    }

    pub fn generations(&self) -> &[Generation<'a>] {
        &self.generations
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// BlockInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockType {
    StageTemplateBlock,
    TemplateBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub content: String,
    pub block_type: BlockType,
    /// Template that supplied the block. `None` for stage template blocks.
    pub ancestor_id: Option<String>,
}

/// Content of `block` in `language`, else in `fallback`.
fn choose_translation<'b>(block: &'b ContentBlock, language: &str, fallback: &str) -> Option<&'b str> {
    block
        .translation(language)
        .or_else(|| block.translation(fallback))
        .map(|t| t.content.as_str())
}

/// Stage template of `key` serving `frontend`.
pub fn stage_template_for<'a>(catalog: &'a Catalog, key: &StageKey, frontend: &str) -> Result<&'a StageTemplate> {
    let definition = catalog.stage_definition(key)?;
    definition
        .stage_templates
        .iter()
        .find(|st| catalog.stage_template_frontend(st).ok() == Some(frontend))
        .ok_or_else(|| {
            EryError::not_found(
                NotFoundKind::StageTemplate,
                format!(
                    "No StageTemplate exists for {} with frontend {}: no matching template for frontend",
                    key, frontend
                ),
            )
        })
}

/// Resolve the named blocks of a stage for `frontend` in `language`.
///
/// Stage template blocks win over template blocks of the same name. Among
/// template blocks the generation closest to the leaf wins. A block without a
/// translation in `language` falls back to its template's primary language;
/// with neither it is skipped and an ancestor may supply the name.
pub fn get_blocks(
    catalog: &Catalog,
    key: &StageKey,
    frontend: &str,
    language: &str,
) -> Result<BTreeMap<String, BlockInfo>> {
    let stage_template = stage_template_for(catalog, key, frontend)?;
    let chain = TemplateChain::build(catalog, &stage_template.template)?;
    let mut blocks = BTreeMap::new();

    let leaf_language = &chain.leaf().primary_language;
    for block in &stage_template.blocks {
        match choose_translation(block, language, leaf_language) {
            Some(content) => {
                blocks.insert(
                    block.name.clone(),
                    BlockInfo {
                        content: content.to_string(),
                        block_type: BlockType::StageTemplateBlock,
                        ancestor_id: None,
                    },
                );
            }
            None => tracing::warn!(
                stage = %key,
                block = %block.name,
                language,
                "stage template block has no usable translation; skipped"
            ),
        }
    }

    for generation in chain.generations() {
        let template = generation.template;
        for block in &template.blocks {
            if blocks.contains_key(&block.name) {
                continue;
            }
            match choose_translation(block, language, &template.primary_language) {
                Some(content) => {
                    blocks.insert(
                        block.name.clone(),
                        BlockInfo {
                            content: content.to_string(),
                            block_type: BlockType::TemplateBlock,
                            ancestor_id: Some(template.name.clone()),
                        },
                    );
                }
                None => tracing::warn!(
                    template = %template.name,
                    block = %block.name,
                    distance = generation.distance,
                    language,
                    "template block has no usable translation; skipped"
                ),
            }
        }
    }

    tracing::debug!(stage = %key, frontend, language, blocks = blocks.len(), "blocks resolved");
    Ok(blocks)
}

/// Whether every block along a template's chain has a translation in `language`.
///
/// Fails with a validation error naming the first template or block that is not ready.
pub fn template_readiness(catalog: &Catalog, name: &str, language: &str) -> Result<()> {
    let chain = TemplateChain::build(catalog, name)?;
    for generation in chain.generations() {
        let template = generation.template;
        if template.blocks.is_empty() {
            return Err(EryError::validation(
                format!("Template '{}'", template.name),
                "blocks",
                format!("template {} has no blocks", template.name),
            ));
        }
        for block in &template.blocks {
            if block.translation(language).is_none() {
                return Err(EryError::validation(
                    format!("Template '{}'", template.name),
                    "blocks",
                    format!(
                        "block {} of template {} has no translation for language {}",
                        block.name, template.name, language
                    ),
                ));
            }
        }
    }
    Ok(())
}

impl Template {
    /// See [`template_readiness`].
    pub fn is_ready(&self, catalog: &Catalog, language: &str) -> bool {
        template_readiness(catalog, &self.name, language).is_ok()
    }
}
