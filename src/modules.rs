use crate::errors::generic_error;
use crate::errors::unwrap_or_exit;
use crate::errors::JsError;
use crate::event_loop::LoopHandle;
use crate::event_loop::TaskResult;
use crate::loaders::FsModuleLoader;
use crate::loaders::MediaType;
use crate::loaders::ModuleLoader;
use crate::loaders::UrlModuleLoader;
use crate::runtime::JsFuture;
use crate::runtime::JsRuntime;
use anyhow::anyhow;
use anyhow::Error;
use anyhow::Result;
use serde_json::Value;
use sha::sha1::Sha1;
use sha::utils::{Digest, DigestExt};
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::LinkedList;
use std::collections::VecDeque;
use std::env;
use std::path::Path;
use std::rc::Rc;
use std::cell::RefCell;
use url::Url;

/// Creates v8 script origins.
pub fn create_origin<'s>(
    scope: &mut v8::HandleScope<'s, ()>,
    name: &str,
    is_module: bool,
) -> v8::ScriptOrigin<'s> {
    let name = v8::String::new(scope, name).unwrap();
    let source_map = v8::undefined(scope);

    v8::ScriptOrigin::new(
        scope,
        name.into(),
        0,
        0,
        false,
        0,
        source_map.into(),
        false,
        false,
        is_module,
    )
}

pub type ModulePath = String;
pub type ModuleSource = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleStatus {
    Fetching,
    Resolving,
    Ready,
}

/// Maps every module seen so far to its V8 handle, plus the pending dynamic
/// imports still being fetched. Separate from `ModuleGraph`: a `ModuleMap`
/// entry survives for the isolate's lifetime, a `ModuleGraph` only for the
/// duration of resolving one static or dynamic import.
#[derive(Default)]
pub struct ModuleMap {
    pub main: Option<ModulePath>,
    pub by_path: HashMap<ModulePath, v8::Global<v8::Module>>,
    pub seen: HashMap<ModulePath, ModuleStatus>,
    pub hashes: HashMap<ModulePath, String>,
    pub pending: Vec<Rc<RefCell<ModuleGraph>>>,
    pub dynamic_imports: VecDeque<(ModulePath, v8::Global<v8::PromiseResolver>)>,
    pub dynamic_imports_seen: HashSet<ModulePath>,
}

impl ModuleMap {
    pub fn new() -> ModuleMap {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, module: v8::Global<v8::Module>, source: &str) {
        if self.main.is_none() {
            self.main = Some(path.into());
        }
        let hash = Sha1::default().digest(source.as_bytes()).to_hex();
        self.hashes.insert(path.into(), hash);
        self.by_path.insert(path.into(), module);
    }

    pub fn has_pending_imports(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn get_module(&self, path: &str) -> Option<v8::Global<v8::Module>> {
        self.by_path.get(path).cloned()
    }

    /// Returns the specifier a module was registered under, matching by V8's
    /// per-isolate identity hash of the `Module` handle rather than pointer
    /// equality (the only stable way to compare two `Global<Module>`s).
    pub fn get_module_path(&self, identity_hash: i32, module: v8::Global<v8::Module>) -> Option<ModulePath> {
        let _ = identity_hash;
        self.by_path
            .iter()
            .find(|(_, m)| **m == module)
            .map(|(p, _)| p.clone())
    }

    pub fn main(&self) -> Option<ModulePath> {
        self.main.clone()
    }

    /// Re-queues a dynamic import so it is retried once the in-flight fetch
    /// for the same specifier settles, rather than being fetched twice.
    pub fn new_dynamic_import(
        &mut self,
        _scope: &mut v8::HandleScope,
        specifier: &str,
        promise: v8::Global<v8::PromiseResolver>,
    ) {
        self.dynamic_imports
            .push_back((specifier.to_string(), promise));
    }
}

#[derive(Debug, Clone)]
pub enum ImportKind {
    Static,
    Dynamic(v8::Global<v8::PromiseResolver>),
}

#[derive(Debug)]
pub struct EsModule {
    pub path: ModulePath,
    pub status: ModuleStatus,
    pub dependencies: Vec<Rc<RefCell<EsModule>>>,
    pub exception: Rc<RefCell<Option<String>>>,
    pub is_dynamic_import: bool,
}

impl EsModule {
    pub fn fast_forward(&mut self) {
        if self.status == ModuleStatus::Ready {
            return;
        }

        self.dependencies
            .iter_mut()
            .for_each(|dep| dep.borrow_mut().fast_forward());

        if self.dependencies.is_empty() {
            if self.status == ModuleStatus::Resolving {
                self.status = ModuleStatus::Ready;
            }
            return;
        }

        let all_ready = self
            .dependencies
            .iter()
            .all(|dep| dep.borrow().status == ModuleStatus::Ready);

        if all_ready {
            self.status = ModuleStatus::Ready;
        }
    }
}

#[derive(Debug)]
pub struct ModuleGraph {
    pub kind: ImportKind,
    pub root_rc: Rc<RefCell<EsModule>>,
    pub same_origin: LinkedList<v8::Global<v8::PromiseResolver>>,
}

impl ModuleGraph {
    pub fn static_import(path: &str) -> ModuleGraph {
        let module = Rc::new(RefCell::new(EsModule {
            path: path.into(),
            status: ModuleStatus::Fetching,
            dependencies: vec![],
            exception: Rc::new(RefCell::new(None)),
            is_dynamic_import: false,
        }));

        Self {
            kind: ImportKind::Static,
            root_rc: module,
            same_origin: LinkedList::new(),
        }
    }

    pub fn dynamic_import(path: &str, promise: v8::Global<v8::PromiseResolver>) -> ModuleGraph {
        let module = Rc::new(RefCell::new(EsModule {
            path: path.into(),
            status: ModuleStatus::Fetching,
            dependencies: vec![],
            exception: Rc::new(RefCell::new(None)),
            is_dynamic_import: true,
        }));

        Self {
            kind: ImportKind::Dynamic(promise),
            root_rc: module,
            same_origin: LinkedList::new(),
        }
    }
}

/// Drives a statically-imported module's subtree to completion, spawned each
/// time a dependency's source finishes loading.
pub struct EsModuleFuture {
    pub path: ModulePath,
    pub module: Rc<RefCell<EsModule>>,
    pub maybe_result: TaskResult,
}

impl EsModuleFuture {
    fn handle_failure(&mut self, e: Error) {
        let module = self.module.borrow();
        if module.is_dynamic_import {
            module.exception.borrow_mut().replace(e.to_string());
            return;
        }
        eprintln!("{}", generic_error(e.to_string()));
        std::process::exit(1);
    }
}

impl JsFuture for EsModuleFuture {
    fn run(&mut self, scope: &mut v8::HandleScope) {
        let state_rc = JsRuntime::state(scope);
        let mut state = state_rc.borrow_mut();

        if self.module.borrow().exception.borrow().is_some() {
            state.modules.seen.remove(&self.path);
            return;
        }

        let source = self.maybe_result.take().unwrap();
        let source = match source {
            Ok(source) => bincode::deserialize::<String>(&source).unwrap(),
            Err(e) => {
                drop(state);
                self.handle_failure(Error::msg(e.to_string()));
                return;
            }
        };

        let tc_scope = &mut v8::TryCatch::new(scope);
        let origin = create_origin(tc_scope, &self.path, true);

        let source_text = v8::String::new(tc_scope, &source).unwrap();
        let compiled = v8::script_compiler::Source::new(source_text, Some(&origin));

        let module = match v8::script_compiler::compile_module(tc_scope, compiled) {
            Some(module) => module,
            None => {
                assert!(tc_scope.has_caught());
                let exception = tc_scope.exception().unwrap();
                let exception = JsError::from_v8_exception(tc_scope, exception, None);
                let exception = format!("{} ({})", exception.message, exception.resource_name);
                drop(state);
                self.handle_failure(Error::msg(exception));
                return;
            }
        };

        state
            .modules
            .insert(&self.path, v8::Global::new(tc_scope, module), &source);

        let import_map = state.options.import_map.clone();
        let skip_cache = self.module.borrow().is_dynamic_import || state.options.reload;

        let mut dependencies = vec![];

        let requests = module.get_module_requests();
        let base = self.path.clone();

        for i in 0..requests.length() {
            let request = requests.get(tc_scope, i).unwrap();
            let request = v8::Local::<v8::ModuleRequest>::try_from(request).unwrap();

            let specifier = request.get_specifier().to_rust_string_lossy(tc_scope);
            let specifier = match resolve_import(Some(base.as_str()), &specifier, import_map.clone()) {
                Ok(specifier) => specifier,
                Err(e) => {
                    drop(state);
                    self.handle_failure(e);
                    return;
                }
            };

            if state.modules.seen.contains_key(&specifier) {
                continue;
            }

            state
                .modules
                .seen
                .insert(specifier.clone(), ModuleStatus::Fetching);

            let dep_module = Rc::new(RefCell::new(EsModule {
                path: specifier.clone(),
                status: ModuleStatus::Fetching,
                dependencies: vec![],
                exception: Rc::clone(&self.module.borrow().exception),
                is_dynamic_import: self.module.borrow().is_dynamic_import,
            }));

            dependencies.push(Rc::clone(&dep_module));

            let task = {
                let specifier = specifier.clone();
                move || match load_import(&specifier, skip_cache) {
                    Ok(source) => Some(Ok(bincode::serialize(&source).unwrap())),
                    Err(e) => Some(Result::Err(e)),
                }
            };

            let task_cb = {
                let state_rc = state_rc.clone();
                move |_: LoopHandle, maybe_result: TaskResult| {
                    let mut state = state_rc.borrow_mut();
                    let future = EsModuleFuture {
                        path: specifier,
                        module: Rc::clone(&dep_module),
                        maybe_result,
                    };
                    state.pending_futures.push(Box::new(future));
                }
            };

            state.handle.spawn(task, Some(task_cb));
        }

        self.module.borrow_mut().status = ModuleStatus::Resolving;
        self.module.borrow_mut().dependencies = dependencies;
    }
}

/// Drives a single dynamic `import()` call's source to a compiled module and
/// settles its promise with the module's namespace object (or a rejection).
pub struct DynamicImportFuture {
    pub specifier: ModulePath,
    pub promise: v8::Global<v8::PromiseResolver>,
    pub maybe_result: TaskResult,
}

impl JsFuture for DynamicImportFuture {
    fn run(&mut self, scope: &mut v8::HandleScope) {
        let state_rc = JsRuntime::state(scope);

        let source = self.maybe_result.take().unwrap();
        let source = match source {
            Ok(source) => bincode::deserialize::<String>(&source).unwrap(),
            Err(e) => {
                // Load failure (not found, network error, ...) rejects with
                // a `TypeError`, matching a resolve-time failure above.
                let tc_scope = &mut v8::HandleScope::new(scope);
                let promise = v8::Local::new(tc_scope, &self.promise);
                let message = v8::String::new(tc_scope, &e.to_string()).unwrap();
                let exception = v8::Exception::type_error(tc_scope, message);
                promise.reject(tc_scope, exception);
                return;
            }
        };

        let tc_scope = &mut v8::TryCatch::new(scope);
        let origin = create_origin(tc_scope, &self.specifier, true);

        let source_text = v8::String::new(tc_scope, &source).unwrap();
        let compiled = v8::script_compiler::Source::new(source_text, Some(&origin));

        let module = match v8::script_compiler::compile_module(tc_scope, compiled) {
            Some(module) => module,
            None => {
                assert!(tc_scope.has_caught());
                let exception = tc_scope.exception().unwrap();
                let promise = v8::Local::new(tc_scope, &self.promise);
                promise.reject(tc_scope, exception);
                return;
            }
        };

        {
            let mut state = state_rc.borrow_mut();
            state
                .modules
                .insert(&self.specifier, v8::Global::new(tc_scope, module), &source);
        }

        if module.instantiate_module(tc_scope, crate::hooks::module_resolve_cb).is_none() {
            assert!(tc_scope.has_caught());
            let exception = tc_scope.exception().unwrap();
            let promise = v8::Local::new(tc_scope, &self.promise);
            promise.reject(tc_scope, exception);
            return;
        }

        let result = module.evaluate(tc_scope);

        if module.get_status() == v8::ModuleStatus::Errored {
            let exception = module.get_exception();
            let promise = v8::Local::new(tc_scope, &self.promise);
            promise.reject(tc_scope, exception);
            return;
        }

        if result.is_none() {
            return;
        }

        let namespace = module.get_module_namespace();
        let promise = v8::Local::new(tc_scope, &self.promise);
        promise.resolve(tc_scope, namespace);

        let mut state = state_rc.borrow_mut();
        if let Some(graph_rc) = state
            .modules
            .pending
            .iter()
            .position(|g| g.borrow().root_rc.borrow().path == self.specifier)
            .map(|i| state.modules.pending.remove(i))
        {
            for sibling in graph_rc.borrow().same_origin.iter() {
                let sibling = v8::Local::new(tc_scope, sibling);
                sibling.resolve(tc_scope, namespace);
            }
        }
    }
}

/// Resolves an import specifier to a canonical module path, consulting the
/// import map (if any) before choosing a loader by specifier shape.
pub fn resolve_import(
    base: Option<&str>,
    specifier: &str,
    import_map: Option<ImportMap>,
) -> Result<ModulePath> {
    let specifier = match import_map {
        Some(map) => map.lookup(specifier).unwrap_or_else(|| specifier.into()),
        None => specifier.into(),
    };

    let loader: Box<dyn ModuleLoader> = pick_loader(&specifier, base);
    loader.resolve(base, &specifier)
}

/// Loads a resolved specifier's source, returning its media type alongside.
pub fn load_import(specifier: &str, skip_cache: bool) -> Result<ModuleSource> {
    let loader: Box<dyn ModuleLoader> = match Url::parse(specifier) {
        Ok(_) => Box::new(UrlModuleLoader { skip_cache }),
        Err(_) => Box::new(FsModuleLoader),
    };

    let (_media_type, source) = loader.load(specifier)?;
    Ok(source)
}

fn pick_loader(specifier: &str, base: Option<&str>) -> Box<dyn ModuleLoader> {
    let is_url = Url::parse(specifier).is_ok()
        || base.is_some_and(|base| Url::parse(base).is_ok());

    if is_url {
        Box::<UrlModuleLoader>::default()
    } else {
        Box::new(FsModuleLoader)
    }
}

type ImportMapEntry = (String, String);

/// Key-Value entries representing WICG import-maps.
#[derive(Debug, Clone)]
pub struct ImportMap {
    map: Vec<ImportMapEntry>,
}

impl ImportMap {
    pub fn parse_from_json(text: &str) -> Result<ImportMap> {
        let json: Value = serde_json::from_str(text)?;
        let imports = json["imports"].to_owned();

        if imports.is_null() || !imports.is_object() {
            return Err(anyhow!("Import map's 'imports' must be an object"));
        }

        let map: HashMap<String, String> = serde_json::from_value(imports)?;
        let mut map: Vec<ImportMapEntry> = Vec::from_iter(map);

        // Sort longest-key-first so "Packages" (trailing-slash prefixes) are
        // matched before a shorter, more general mapping would shadow them.
        // https://github.com/WICG/import-maps#packages-via-trailing-slashes
        map.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(ImportMap { map })
    }

    pub fn lookup(&self, specifier: &str) -> Option<String> {
        let (base, mut target) = self
            .map
            .iter()
            .find(|(k, _)| specifier.starts_with(k.as_str()))
            .cloned()?;

        if let Some(rest) = target.strip_prefix("./") {
            let cwd = env::current_dir().unwrap().to_string_lossy().to_string();
            target = format!("{cwd}/{rest}");
        }

        // https://github.com/WICG/import-maps#extension-less-imports
        match Path::new(specifier).extension() {
            Some(ext) if Path::new(specifier) == Path::new(&base).with_extension(ext) => None,
            _ => Some(specifier.replacen(&base, &target, 1)),
        }
    }
}

/// Resolves module imports synchronously, used once for the entry module.
/// https://source.chromium.org/chromium/v8/v8.git/+/51e736ca62bd5c7bfd82488a5587fed31dbf45d5:src/d8.cc;l=741
pub fn fetch_module_tree<'a>(
    scope: &mut v8::HandleScope<'a>,
    filename: &str,
    source: Option<&str>,
) -> Option<v8::Local<'a, v8::Module>> {
    let origin = create_origin(scope, filename, true);
    let state = JsRuntime::state(scope);

    let source = match source {
        Some(source) => source.into(),
        None => unwrap_or_exit(load_import(filename, true)),
    };

    let source_text = v8::String::new(scope, &source).unwrap();
    let compiled = v8::script_compiler::Source::new(source_text, Some(&origin));

    let module = v8::script_compiler::compile_module(scope, compiled)?;

    let module_ref = v8::Global::new(scope, module);
    state.borrow_mut().modules.insert(filename, module_ref, &source);

    let requests = module.get_module_requests();

    for i in 0..requests.length() {
        let request = requests.get(scope, i).unwrap();
        let request = v8::Local::<v8::ModuleRequest>::try_from(request).unwrap();

        let specifier = request.get_specifier().to_rust_string_lossy(scope);
        let specifier = unwrap_or_exit(resolve_import(Some(filename), &specifier, None));

        if !state.borrow().modules.by_path.contains_key(&specifier) {
            fetch_module_tree(scope, &specifier, None)?;
        }
    }

    Some(module)
}

/// Tags a loaded specifier with its coarse content type, used by the module
/// instantiation path to decide whether the source needs JSON wrapping.
pub fn media_type_of(specifier: &str) -> MediaType {
    MediaType::from_specifier(specifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_map_prefers_longer_package_prefixes() {
        let json = r#"{"imports": {"a/": "./vendor/a/", "a/b": "./vendor/ab.js"}}"#;
        let map = ImportMap::parse_from_json(json).unwrap();
        assert_eq!(map.map[0].0, "a/b");
    }

    #[test]
    fn import_map_resolves_a_prefix_mapping() {
        let json = r#"{"imports": {"pkg/": "./vendor/pkg/"}}"#;
        let map = ImportMap::parse_from_json(json).unwrap();
        let resolved = map.lookup("pkg/mod.js").unwrap();
        assert!(resolved.ends_with("/vendor/pkg/mod.js"));
    }

    #[test]
    fn fast_forward_marks_leaf_modules_ready() {
        let module = Rc::new(RefCell::new(EsModule {
            path: "leaf.js".into(),
            status: ModuleStatus::Resolving,
            dependencies: vec![],
            exception: Rc::new(RefCell::new(None)),
            is_dynamic_import: false,
        }));
        module.borrow_mut().fast_forward();
        assert_eq!(module.borrow().status, ModuleStatus::Ready);
    }
}
