//! Module wrapper with explicit interface delegation
//!
//! A wrapped value answers the fixed [`ModuleInterface`] methods itself and
//! hands every other call to its delegate through `Deref`/`DerefMut`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

/// One callable entry point a module publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    /// `(argument, type)` pairs in call order
    pub input: Vec<(String, String)>,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<String>,
}

impl FunctionSchema {
    pub fn new(name: &str, input: &[(&str, &str)], output: &str) -> Self {
        Self {
            name: name.to_string(),
            input: input.iter().map(|(a, t)| (a.to_string(), t.to_string())).collect(),
            output: output.to_string(),
            docs: None,
        }
    }

    pub fn with_docs(mut self, docs: &str) -> Self {
        self.docs = Some(docs.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub module_path: String,
    pub module_file: String,
    pub server_name: String,
    pub functions: Vec<String>,
    pub schema: BTreeMap<String, FunctionSchema>,
}

/// What a delegate tells the wrapper about itself
pub trait Describe {
    /// Source file that defines the module
    fn module_file(&self) -> &'static str;

    fn functions(&self) -> Vec<FunctionSchema>;

    /// Smoke test run by [`ModuleInterface::test`]
    fn self_test(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Methods that always resolve against the wrapper, never the delegate
pub trait ModuleInterface {
    fn info(&self) -> ModuleInfo;
    fn module_path(&self) -> String;
    fn module_file(&self) -> &'static str;
    fn server_name(&self) -> String;
    fn schema(&self) -> BTreeMap<String, FunctionSchema>;
    fn functions(&self) -> Vec<String>;
    fn test(&mut self) -> Result<()>;
}

pub struct ModuleWrapper<M> {
    module: M,
    server_name: Option<String>,
}

impl<M: Describe> ModuleWrapper<M> {
    pub fn new(module: M) -> Self {
        Self {
            module,
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn inner(&self) -> &M {
        &self.module
    }

    pub fn into_inner(self) -> M {
        self.module
    }
}

/// Lowercased type name without its module path or generic arguments
fn short_type_name<M>() -> String {
    let full = std::any::type_name::<M>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_lowercase()
}

impl<M: Describe> ModuleInterface for ModuleWrapper<M> {
    fn info(&self) -> ModuleInfo {
        ModuleInfo {
            module_path: self.module_path(),
            module_file: self.module_file().to_string(),
            server_name: self.server_name(),
            functions: self.functions(),
            schema: self.schema(),
        }
    }

    fn module_path(&self) -> String {
        short_type_name::<M>()
    }

    fn module_file(&self) -> &'static str {
        self.module.module_file()
    }

    fn server_name(&self) -> String {
        self.server_name.clone().unwrap_or_else(|| self.module_path())
    }

    fn schema(&self) -> BTreeMap<String, FunctionSchema> {
        self.module
            .functions()
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect()
    }

    fn functions(&self) -> Vec<String> {
        self.schema().into_keys().collect()
    }

    fn test(&mut self) -> Result<()> {
        self.module.self_test()
    }
}

impl<M> Deref for ModuleWrapper<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.module
    }
}

impl<M> DerefMut for ModuleWrapper<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        count: usize,
        tested: bool,
    }

    impl Counter {
        fn bump(&mut self) -> usize {
            self.count += 1;
            self.count
        }

        // Same name as a wrapper method; must not shadow it
        fn server_name(&self) -> &'static str {
            "delegate"
        }
    }

    impl Describe for Counter {
        fn module_file(&self) -> &'static str {
            file!()
        }

        fn functions(&self) -> Vec<FunctionSchema> {
            vec![
                FunctionSchema::new("bump", &[], "usize"),
                FunctionSchema::new("add", &[("n", "usize")], "usize").with_docs("adds n"),
            ]
        }

        fn self_test(&mut self) -> Result<()> {
            self.tested = true;
            Ok(())
        }
    }

    fn wrapped() -> ModuleWrapper<Counter> {
        ModuleWrapper::new(Counter { count: 0, tested: false })
    }

    #[test]
    fn test_unknown_calls_reach_the_delegate() {
        let mut module = wrapped();
        assert_eq!(module.bump(), 1);
        assert_eq!(module.bump(), 2);
        assert_eq!(module.count, 2);
    }

    #[test]
    fn test_protected_names_resolve_on_the_wrapper() {
        let module = wrapped();
        assert_eq!(ModuleInterface::server_name(&module), "counter");
        assert_eq!(module.inner().server_name(), "delegate");
        assert_eq!(module.module_path(), "counter");
        assert!(module.module_file().ends_with("module.rs"));

        let named = wrapped().with_server_name("counter::7");
        assert_eq!(ModuleInterface::server_name(&named), "counter::7");
    }

    #[test]
    fn test_schema_and_functions_come_from_the_delegate() {
        let module = wrapped();
        assert_eq!(module.functions(), vec!["add".to_string(), "bump".to_string()]);
        let schema = module.schema();
        assert_eq!(schema["add"].input, vec![("n".to_string(), "usize".to_string())]);
        assert_eq!(schema["add"].docs.as_deref(), Some("adds n"));

        let info = module.info();
        assert_eq!(info.functions.len(), 2);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["module_path"], "counter");
    }

    #[test]
    fn test_runs_delegate_self_test() -> Result<()> {
        let mut module = wrapped();
        module.test()?;
        assert!(module.tested);
        Ok(())
    }

    #[test]
    fn test_short_type_name_strips_generics() {
        assert_eq!(short_type_name::<Vec<u8>>(), "vec");
        assert_eq!(short_type_name::<Counter>(), "counter");
    }
}
