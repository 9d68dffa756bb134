//! Prediction manifest (`predictions.json`) written by the challenge platform.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ToolboxError;
use crate::predict::interface::InterfaceKind;

/// Job primary key. The platform uses UUID strings, older exports numbers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum JobKey {
    Text(String),
    Number(serde_json::Number),
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InterfaceRef {
    pub slug: String,
    pub relative_path: String,
    /// Platform label such as `Segmentation`; older exports omit it.
    #[serde(default)]
    pub kind: Option<String>,
}

impl InterfaceRef {
    /// Declared kind, when present and known.
    pub fn known_kind(&self) -> Option<InterfaceKind> {
        self.kind.as_deref().and_then(InterfaceKind::from_label)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageRef {
    pub name: String,
}

/// One interface value of a job. Non-image values carry no `image`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobValue {
    pub interface: InterfaceRef,
    #[serde(default)]
    pub image: Option<ImageRef>,
}

/// One algorithm job: the inputs it ran on and the outputs it produced.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Job {
    pub pk: JobKey,
    pub inputs: Vec<JobValue>,
    pub outputs: Vec<JobValue>,
}

impl Job {
    /// User-provided file name of the input image bound to `slug`.
    pub fn image_name(&self, slug: &str) -> Result<&str, ToolboxError> {
        self.inputs
            .iter()
            .find(|v| v.interface.slug == slug)
            .and_then(|v| v.image.as_ref())
            .map(|image| image.name.as_str())
            .ok_or_else(|| ToolboxError::InterfaceNotFound {
                slug: slug.to_string(),
            })
    }

    /// Relative path of the output interface bound to `slug`.
    pub fn output_relative_path(&self, slug: &str) -> Result<&str, ToolboxError> {
        self.outputs
            .iter()
            .find(|v| v.interface.slug == slug)
            .map(|v| v.interface.relative_path.as_str())
            .ok_or_else(|| ToolboxError::InterfaceNotFound {
                slug: slug.to_string(),
            })
    }

    /// Declared kind of the output interface bound to `slug`.
    pub fn output_kind(&self, slug: &str) -> Option<InterfaceKind> {
        self.outputs
            .iter()
            .find(|v| v.interface.slug == slug)
            .and_then(|v| v.interface.known_kind())
    }

    /// Folder holding this job's output for `slug`:
    /// `<input_root>/<pk>/output/<relative_path>`.
    pub fn output_location(&self, input_root: &Path, slug: &str) -> Result<PathBuf, ToolboxError> {
        let relative_path = self.output_relative_path(slug)?;
        Ok(input_root
            .join(self.pk.to_string())
            .join("output")
            .join(relative_path))
    }

    /// Batch id derived from the first slug's image name. With `cross_check`
    /// every other slug must resolve to the same id.
    pub fn batch_id(&self, slugs: &[&str], cross_check: bool) -> Result<String, ToolboxError> {
        let names = slugs
            .iter()
            .map(|slug| self.image_name(slug).map(|name| (*slug, name)))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(((_, primary), rest)) = names.split_first() else {
            return Err(ToolboxError::InterfaceNotFound {
                slug: String::new(),
            });
        };

        let expected = batch_id(primary)?;
        if cross_check {
            for (slug, name) in rest {
                let found = batch_id(name)?;
                if found != expected {
                    return Err(ToolboxError::BatchIdMismatch {
                        expected,
                        found,
                        slug: slug.to_string(),
                    });
                }
            }
        }
        Ok(expected)
    }
}

/// Case identifier from an image file name: `_`-separated tokens 1 and 4,
/// each cut at its first `.`, joined with `_`.
///
/// `sppin_001_t1_mr_2017.mha` becomes `001_2017`.
pub fn batch_id(name: &str) -> Result<String, ToolboxError> {
    let tokens: Vec<&str> = name.split('_').collect();
    match (tokens.get(1), tokens.get(4)) {
        (Some(first), Some(second)) => Ok(format!("{}_{}", stem(first), stem(second))),
        _ => Err(ToolboxError::MalformedImageName {
            name: name.to_string(),
        }),
    }
}

fn stem(token: &str) -> &str {
    token.split('.').next().unwrap_or(token)
}

pub fn read_manifest(path: &Path) -> Result<Vec<Job>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read predictions: {path:?}"))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid predictions file: {path:?}"))
}
