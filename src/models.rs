/// Model storage and selection
///
/// A model location holds one entry per model (a file or a directory in
/// the model partition). Names follow the vendor convention: a family
/// prefix (`wn` for wake models, `mn` for command models) followed by
/// version and language tags, e.g. `wn9_hilexin` or `mn5q8_en`.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Wake-word (WakeNet-class) model prefix
pub const WAKENET_PREFIX: &str = "wn";

/// Command (MultiNet-class) model prefix
pub const MULTINET_PREFIX: &str = "mn";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read model location {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No models found in {0}")]
    Empty(PathBuf),

    #[error("No model matching prefix '{prefix}'{}", keyword_suffix(.keyword))]
    NotFound {
        prefix: String,
        keyword: Option<String>,
    },
}

fn keyword_suffix(keyword: &Option<String>) -> String {
    keyword
        .as_ref()
        .map(|k| format!(" and keyword '{}'", k))
        .unwrap_or_default()
}

/// A selected model: its name and position in the set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHandle {
    name: String,
    index: usize,
}

impl ModelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// All models available at a location
#[derive(Debug, Clone, Default)]
pub struct ModelSet {
    names: Vec<String>,
}

impl ModelSet {
    /// List the models at `location`, skipping hidden entries
    pub fn load(location: impl AsRef<Path>) -> Result<Self, ModelError> {
        let location = location.as_ref();
        let io_err = |source| ModelError::Io {
            path: location.to_path_buf(),
            source,
        };

        let mut names = Vec::new();
        for entry in fs::read_dir(location).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }

        if names.is_empty() {
            return Err(ModelError::Empty(location.to_path_buf()));
        }

        names.sort();
        info!("Loaded {} model(s) from {}", names.len(), location.display());
        debug!("Models: {:?}", names);

        Ok(Self { names })
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// First model whose name starts with `prefix` and, if given,
    /// contains `keyword` in the remainder of the name
    pub fn filter(&self, prefix: &str, keyword: Option<&str>) -> Option<ModelHandle> {
        self.names
            .iter()
            .enumerate()
            .find(|(_, name)| match name.strip_prefix(prefix) {
                Some(rest) => keyword.map_or(true, |k| rest.contains(k)),
                None => false,
            })
            .map(|(index, name)| ModelHandle {
                name: name.clone(),
                index,
            })
    }

    /// Like `filter`, but a missing model is an error
    pub fn require(&self, prefix: &str, keyword: Option<&str>) -> Result<ModelHandle, ModelError> {
        self.filter(prefix, keyword).ok_or_else(|| ModelError::NotFound {
            prefix: prefix.to_string(),
            keyword: keyword.map(str::to_string),
        })
    }
}
