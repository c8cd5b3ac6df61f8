use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use super::ToolHandler;
use crate::error::ToolError;
use crate::types::ToolDeclaration;

#[derive(Clone)]
struct RegisteredTool {
    declaration: ToolDeclaration,
    handler: Arc<dyn ToolHandler>,
}

/// Concurrent name → handler map.
///
/// Entries are sharded, so a registration only locks its own shard.
/// Handlers are cloned out of the map before they run, so registration and
/// lookups never wait on an executing tool.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under the declaration's name.  Returns `false`
    /// and leaves the existing entry untouched when the name is taken.
    pub fn register<H>(&self, declaration: ToolDeclaration, handler: H) -> bool
    where
        H: ToolHandler + 'static,
    {
        self.register_arc(declaration, Arc::new(handler))
    }

    pub fn register_arc(&self, declaration: ToolDeclaration, handler: Arc<dyn ToolHandler>) -> bool {
        match self.tools.entry(declaration.name.clone()) {
            Entry::Occupied(_) => {
                debug!(tool = %declaration.name, "tool already registered");
                false
            }
            Entry::Vacant(slot) => {
                info!(tool = %declaration.name, "tool registered");
                slot.insert(RegisteredTool {
                    declaration,
                    handler,
                });
                true
            }
        }
    }

    pub fn unregister(&self, name: &str) -> Result<(), ToolError> {
        match self.tools.remove(name) {
            Some(_) => {
                info!(tool = %name, "tool unregistered");
                Ok(())
            }
            None => Err(ToolError::NotRegistered(name.to_owned())),
        }
    }

    /// Replace the declaration and handler of a registered tool.
    ///
    /// A declaration carrying a different name moves the entry, unless that
    /// name already belongs to another tool.
    pub fn update<H>(&self, name: &str, declaration: ToolDeclaration, handler: H) -> Result<(), ToolError>
    where
        H: ToolHandler + 'static,
    {
        let tool = RegisteredTool {
            declaration,
            handler: Arc::new(handler),
        };

        if tool.declaration.name == name {
            let Some(mut entry) = self.tools.get_mut(name) else {
                return Err(ToolError::NotRegistered(name.to_owned()));
            };
            *entry = tool;
            info!(tool = %name, "tool updated");
            return Ok(());
        }

        if !self.tools.contains_key(name) {
            return Err(ToolError::NotRegistered(name.to_owned()));
        }
        let renamed = tool.declaration.name.clone();
        match self.tools.entry(renamed.clone()) {
            Entry::Occupied(_) => return Err(ToolError::AlreadyRegistered(renamed)),
            Entry::Vacant(slot) => {
                slot.insert(tool);
            }
        }
        self.tools.remove(name);
        info!(tool = %name, renamed = %renamed, "tool updated");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Whether `declaration` names a registered tool with an identical
    /// parameter schema.
    pub fn validate(&self, declaration: &ToolDeclaration) -> bool {
        self.tools
            .get(&declaration.name)
            .is_some_and(|tool| tool.declaration.parameters == declaration.parameters)
    }

    /// Registered declarations, sorted by name.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<_> = self
            .tools
            .iter()
            .map(|tool| tool.declaration.clone())
            .collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.iter().map(|tool| tool.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub(crate) fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|tool| Arc::clone(&tool.handler))
    }
}
