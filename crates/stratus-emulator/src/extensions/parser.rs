//! Loading extension scripts.
//!
//! An extension file is a Rhai script. Functions named `Type__capability`
//! form the extension type `Type`; unprefixed capability functions form the
//! file's default type. Recognised capabilities are `id`, `selector`, `init`,
//! `request_hook` and `response_hook`; a type is an extension when it has at
//! least one of the two hooks. Other functions are helpers and are ignored.
//! Header names handed to hooks are lowercase.
//!
//! ```rhai
//! fn Audit__id() { "audit" }
//! fn Audit__selector() { ["svc1:Ping"] }
//! fn Audit__init() { #{ seen: 0 } }
//! fn Audit__request_hook(request) {
//!     this.seen += 1;
//!     if request.headers["x-block"] == "1" {
//!         return #{ status: 403, body: "blocked" };
//!     }
//! }
//! ```

use super::script::{create_engine, HookFunctions, ScriptExtension, REQUEST_HOOK, RESPONSE_HOOK};
use super::Extension;
use crate::registry::OperationCatalog;
use once_cell::sync::Lazy;
use regex::Regex;
use rhai::{Array, CallFnOptions, Dynamic, Engine, EvalAltResult, Map, Scope, AST};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const ID: &str = "id";
const SELECTOR: &str = "selector";
const INIT: &str = "init";
const CAPABILITIES: [&str; 5] = [ID, SELECTOR, INIT, REQUEST_HOOK, RESPONSE_HOOK];

/// Name reported for the group of unprefixed functions.
pub const DEFAULT_TYPE: &str = "default";

static ID_PATTERN: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$"));

#[derive(Debug, Error)]
pub enum ExtensionParseError {
    #[error("Failed to read extension file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Syntax error in extension script: {0}")]
    Syntax(String),

    #[error("No extension types found (a type needs request_hook or response_hook)")]
    NoExtensionsFound,

    #[error("Extension type '{0}' declares more than one init")]
    TooManyInitializers(String),

    #[error("init of extension type '{type_name}' must take no parameters, found ({params})")]
    ParametrizedInitializer { type_name: String, params: String },

    #[error("Extension type '{0}' does not declare a parameterless id()")]
    MissingIdAccessor(String),

    #[error("Extension type '{type_name}' declares {function} with the wrong parameters (expected {expected})")]
    InvalidHookSignature {
        type_name: String,
        function: String,
        expected: usize,
    },

    #[error("Extension type '{type_name}' selects unknown operation '{operation}'")]
    UnknownOperation { type_name: String, operation: String },

    #[error("Extension type '{type_name}' has an invalid selector: {reason}")]
    InvalidSelector { type_name: String, reason: String },

    #[error("Extension type '{type_name}' has an invalid id: {reason}")]
    InvalidId { type_name: String, reason: String },

    #[error("Extension script failed while loading '{type_name}': {message}")]
    Runtime { type_name: String, message: String },
}

/// Capability functions found for one type prefix, as parameter lists.
#[derive(Debug, Default)]
struct TypeDeclaration {
    prefix: String,
    functions: BTreeMap<&'static str, Vec<Vec<String>>>,
}

impl TypeDeclaration {
    fn type_name(&self) -> &str {
        if self.prefix.is_empty() {
            DEFAULT_TYPE
        } else {
            &self.prefix
        }
    }

    fn function_name(&self, capability: &str) -> String {
        if self.prefix.is_empty() {
            capability.to_string()
        } else {
            format!("{}__{}", self.prefix, capability)
        }
    }

    fn overloads(&self, capability: &str) -> &[Vec<String>] {
        self.functions
            .get(capability)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn has_arity(&self, capability: &str, arity: usize) -> bool {
        self.overloads(capability).iter().any(|p| p.len() == arity)
    }

    fn is_extension(&self) -> bool {
        self.functions.contains_key(REQUEST_HOOK) || self.functions.contains_key(RESPONSE_HOOK)
    }
}

/// Parses extension scripts against a known operation catalog.
pub struct ExtensionParser {
    catalog: OperationCatalog,
    engine: Arc<Engine>,
}

impl ExtensionParser {
    pub fn new(catalog: OperationCatalog) -> Self {
        Self::with_engine(catalog, Arc::new(create_engine()))
    }

    pub fn with_engine(catalog: OperationCatalog, engine: Arc<Engine>) -> Self {
        Self { catalog, engine }
    }

    pub fn parse_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<BTreeMap<String, Arc<ScriptExtension>>, ExtensionParseError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ExtensionParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_source(&source)
    }

    /// Validate `source`, then run it once and instantiate every type.
    ///
    /// Validation happens before any script code runs, apart from the
    /// `selector()` functions which are evaluated on their own.
    pub fn parse_source(
        &self,
        source: &str,
    ) -> Result<BTreeMap<String, Arc<ScriptExtension>>, ExtensionParseError> {
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| ExtensionParseError::Syntax(e.to_string()))?;

        let declarations = declarations(&ast);
        if declarations.is_empty() {
            return Err(ExtensionParseError::NoExtensionsFound);
        }

        let mut selectors = Vec::with_capacity(declarations.len());
        for decl in &declarations {
            validate_declaration(decl)?;
            selectors.push(self.evaluate_selector(&ast, decl)?);
        }

        self.engine
            .run_ast_with_scope(&mut Scope::new(), &ast)
            .map_err(|e| ExtensionParseError::Runtime {
                type_name: DEFAULT_TYPE.to_string(),
                message: e.to_string(),
            })?;

        let ast = Arc::new(ast);
        let mut extensions = BTreeMap::new();
        for (decl, selector) in declarations.iter().zip(selectors) {
            let extension = self.instantiate(&ast, decl, selector)?;
            let id = extension.id().to_string();
            if extensions.contains_key(&id) {
                return Err(ExtensionParseError::InvalidId {
                    type_name: decl.type_name().to_string(),
                    reason: format!("duplicate id '{}'", id),
                });
            }
            debug!("Parsed extension {} (type {})", id, decl.type_name());
            extensions.insert(id, Arc::new(extension));
        }
        Ok(extensions)
    }

    fn call(
        &self,
        ast: &AST,
        function: &str,
        this: Option<&mut Dynamic>,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        let mut options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        if let Some(this) = this {
            options = options.bind_this_ptr(this);
        }
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut Scope::new(), ast, function, ())
    }

    fn evaluate_selector(
        &self,
        ast: &AST,
        decl: &TypeDeclaration,
    ) -> Result<BTreeSet<String>, ExtensionParseError> {
        let type_name = decl.type_name().to_string();
        let invalid = |reason: String| ExtensionParseError::InvalidSelector {
            type_name: type_name.clone(),
            reason,
        };

        if decl.overloads(SELECTOR).is_empty() {
            return Err(invalid("selector() is not declared".to_string()));
        }
        if !decl.has_arity(SELECTOR, 0) {
            return Err(invalid("selector() must take no parameters".to_string()));
        }

        let value = self
            .call(ast, &decl.function_name(SELECTOR), None)
            .map_err(|e| invalid(e.to_string()))?;
        let value_type = value.type_name();
        let entries = value
            .try_cast::<Array>()
            .ok_or_else(|| invalid(format!("expected a list of strings, got {}", value_type)))?;

        let mut selector = BTreeSet::new();
        for entry in entries {
            let entry_type = entry.type_name();
            let entry = entry
                .into_string()
                .map_err(|_| invalid(format!("expected a string entry, got {}", entry_type)))?;
            match entry.split_once(':') {
                Some((service, operation)) if !service.is_empty() && !operation.is_empty() => {}
                _ => return Err(invalid(format!("'{}' is not Service:Operation", entry))),
            }
            if !self.catalog.contains(&entry) {
                return Err(ExtensionParseError::UnknownOperation {
                    type_name: type_name.clone(),
                    operation: entry,
                });
            }
            selector.insert(entry);
        }
        Ok(selector)
    }

    fn instantiate(
        &self,
        ast: &Arc<AST>,
        decl: &TypeDeclaration,
        selector: BTreeSet<String>,
    ) -> Result<ScriptExtension, ExtensionParseError> {
        let type_name = decl.type_name().to_string();
        let runtime = |e: Box<EvalAltResult>| ExtensionParseError::Runtime {
            type_name: type_name.clone(),
            message: e.to_string(),
        };

        let mut state = if decl.functions.contains_key(INIT) {
            self.call(ast, &decl.function_name(INIT), None)
                .map_err(runtime)?
        } else {
            Dynamic::from_map(Map::new())
        };
        if state.is_unit() {
            state = Dynamic::from_map(Map::new());
        }

        let id = self
            .call(ast, &decl.function_name(ID), Some(&mut state))
            .map_err(runtime)?;
        let id_type = id.type_name();
        let id = id
            .into_string()
            .map_err(|_| ExtensionParseError::InvalidId {
                type_name: type_name.clone(),
                reason: format!("id() must return a string, got {}", id_type),
            })?;
        validate_id(&type_name, &id)?;

        let hooks = HookFunctions {
            request_hook: decl
                .functions
                .contains_key(REQUEST_HOOK)
                .then(|| decl.function_name(REQUEST_HOOK)),
            response_hook: decl
                .functions
                .contains_key(RESPONSE_HOOK)
                .then(|| decl.function_name(RESPONSE_HOOK)),
        };

        Ok(ScriptExtension::new(
            id,
            type_name,
            selector,
            hooks,
            Arc::clone(&self.engine),
            Arc::clone(ast),
            state,
        ))
    }
}

/// Group capability functions by type prefix, keeping only extension types.
fn declarations(ast: &AST) -> Vec<TypeDeclaration> {
    let mut groups: BTreeMap<String, TypeDeclaration> = BTreeMap::new();
    for function in ast.iter_functions() {
        let (prefix, capability) = match function.name.rsplit_once("__") {
            Some((prefix, capability)) => (prefix, capability),
            None => ("", function.name),
        };
        let Some(capability) = CAPABILITIES.iter().copied().find(|c| *c == capability) else {
            continue;
        };
        groups
            .entry(prefix.to_string())
            .or_insert_with(|| TypeDeclaration {
                prefix: prefix.to_string(),
                ..Default::default()
            })
            .functions
            .entry(capability)
            .or_default()
            .push(function.params.iter().map(|p| p.to_string()).collect());
    }
    groups
        .into_values()
        .filter(TypeDeclaration::is_extension)
        .collect()
}

fn validate_declaration(decl: &TypeDeclaration) -> Result<(), ExtensionParseError> {
    let type_name = decl.type_name().to_string();

    match decl.overloads(INIT) {
        [] => {}
        [params] if params.is_empty() => {}
        [params] => {
            return Err(ExtensionParseError::ParametrizedInitializer {
                type_name,
                params: params.join(", "),
            })
        }
        _ => return Err(ExtensionParseError::TooManyInitializers(type_name)),
    }

    if !decl.has_arity(ID, 0) {
        return Err(ExtensionParseError::MissingIdAccessor(type_name));
    }

    for (hook, expected) in [(REQUEST_HOOK, 1), (RESPONSE_HOOK, 3)] {
        if !decl.overloads(hook).is_empty() && !decl.has_arity(hook, expected) {
            return Err(ExtensionParseError::InvalidHookSignature {
                type_name,
                function: decl.function_name(hook),
                expected,
            });
        }
    }
    Ok(())
}

fn validate_id(type_name: &str, id: &str) -> Result<(), ExtensionParseError> {
    let invalid = |reason: String| ExtensionParseError::InvalidId {
        type_name: type_name.to_string(),
        reason,
    };
    if id.is_empty() {
        return Err(invalid("id is empty".to_string()));
    }
    let pattern = ID_PATTERN
        .as_ref()
        .map_err(|e| invalid(format!("id pattern unavailable: {}", e)))?;
    if !pattern.is_match(id) {
        return Err(invalid(format!("'{}' contains unsupported characters", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Headers, ServiceRequest, ServiceResponse};
    use bytes::Bytes;
    use std::io::Write;
    use tracing_test::traced_test;

    fn catalog() -> OperationCatalog {
        ["svc1:Ping", "svc1:Echo", "sqs:SendMessage"]
            .into_iter()
            .collect()
    }

    fn parse(source: &str) -> Result<BTreeMap<String, Arc<ScriptExtension>>, ExtensionParseError> {
        ExtensionParser::new(catalog()).parse_source(source)
    }

    fn ping_request(headers: &[(&str, &str)]) -> ServiceRequest {
        ServiceRequest {
            method: "GET".to_string(),
            url: "https://svc1.example.com/ping?verbose=1".to_string(),
            headers: headers.iter().copied().collect::<Headers>(),
            body: Bytes::new(),
            service: "svc1".to_string(),
            operation: Some("Ping".to_string()),
            account_id: "123456789012".to_string(),
            region: "global".to_string(),
        }
    }

    const AUDIT: &str = r#"
        fn Audit__id() { "audit" }
        fn Audit__selector() { ["svc1:Ping"] }
        fn Audit__init() { #{ seen: 0 } }
        fn Audit__request_hook(request) {
            this.seen += 1;
            if request.headers["x-block"] == "1" {
                return #{ status: 403, body: "blocked " + request.query.verbose };
            }
        }

        fn Tag__id() { "tag-" + this.suffix }
        fn Tag__init() { #{ suffix: "v1" } }
        fn Tag__selector() { ["svc1:Ping", "svc1:Echo"] }
        fn Tag__response_hook(status, headers, body) {
            headers["X-Tagged"] = "yes";
            #{ status: status, headers: headers, body: body + "!" }
        }

        fn helper() { 1 }
    "#;

    #[test]
    fn test_parse_multiple_types() {
        let parsed = parse(AUDIT).unwrap();
        assert_eq!(
            parsed.keys().cloned().collect::<Vec<_>>(),
            vec!["audit", "tag-v1"]
        );
        let tag = &parsed["tag-v1"];
        assert_eq!(tag.type_name(), "Tag");
        assert!(tag.selects("svc1:Echo"));
    }

    #[test]
    fn test_request_hook_uses_state_and_short_circuits() {
        let parsed = parse(AUDIT).unwrap();
        let audit = &parsed["audit"];

        assert!(audit.request_hook(&ping_request(&[])).is_none());
        let blocked = audit
            .request_hook(&ping_request(&[("X-Block", "1")]))
            .unwrap();
        assert_eq!(blocked.status, 403);
        assert_eq!(blocked.body_text(), "blocked 1");

        let state = audit.state().cast::<Map>();
        assert_eq!(state["seen"].as_int().unwrap(), 2);
    }

    #[test]
    fn test_response_hook_rewrites() {
        let parsed = parse(AUDIT).unwrap();
        let original = ServiceResponse::ok("pong").with_header("Content-Length", "4");
        let replaced = parsed["tag-v1"].response_hook(&original).unwrap();
        assert_eq!(replaced.status, 200);
        assert_eq!(replaced.body_text(), "pong!");
        assert_eq!(replaced.headers.get("x-tagged"), Some("yes"));
        assert_eq!(replaced.headers.get("content-length"), Some("4"));
    }

    #[test]
    fn test_default_type_without_prefix() {
        let parsed = parse(
            r#"
            fn id() { "plain" }
            fn selector() { ["sqs:SendMessage"] }
            fn request_hook(request) { #{ status: 201, body: "intercepted" } }
        "#,
        )
        .unwrap();
        assert_eq!(parsed["plain"].type_name(), DEFAULT_TYPE);
    }

    #[test]
    #[traced_test]
    fn test_runtime_error_in_hook_is_no_result() {
        let parsed = parse(
            r#"
            fn id() { "broken" }
            fn selector() { ["svc1:Ping"] }
            fn request_hook(request) { throw "nope"; }
        "#,
        )
        .unwrap();
        assert!(parsed["broken"].request_hook(&ping_request(&[])).is_none());
        assert!(logs_contain("Extension broken request_hook failed"));
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(
            parse("fn id( { "),
            Err(ExtensionParseError::Syntax(_))
        ));
    }

    #[test]
    fn test_no_extensions_found() {
        assert!(matches!(
            parse("fn id() { \"x\" } fn helper() { 1 }"),
            Err(ExtensionParseError::NoExtensionsFound)
        ));
    }

    #[test]
    fn test_too_many_initializers() {
        let err = parse(
            r#"
            fn A__id() { "a" }
            fn A__selector() { ["svc1:Ping"] }
            fn A__init() { #{} }
            fn A__init(x) { #{} }
            fn A__request_hook(request) { }
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, ExtensionParseError::TooManyInitializers(t) if t == "A"));
    }

    #[test]
    fn test_parametrized_initializer() {
        let err = parse(
            r#"
            fn A__id() { "a" }
            fn A__selector() { ["svc1:Ping"] }
            fn A__init(seed) { #{} }
            fn A__request_hook(request) { }
        "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ExtensionParseError::ParametrizedInitializer { ref params, .. } if params == "seed"
        ));
    }

    #[test]
    fn test_missing_id_accessor() {
        let err = parse(
            r#"
            fn A__selector() { ["svc1:Ping"] }
            fn A__request_hook(request) { }
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, ExtensionParseError::MissingIdAccessor(t) if t == "A"));
    }

    #[test]
    fn test_unknown_operation() {
        let err = parse(
            r#"
            fn A__id() { "a" }
            fn A__selector() { ["svc1:Ping", "svc1:Explode"] }
            fn A__request_hook(request) { }
        "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ExtensionParseError::UnknownOperation { ref operation, .. } if operation == "svc1:Explode"
        ));
    }

    #[test]
    fn test_invalid_selector_shapes() {
        for selector in [r#""svc1:Ping""#, "[42]", r#"["Ping"]"#] {
            let source = format!(
                "fn A__id() {{ \"a\" }} fn A__selector() {{ {} }} fn A__request_hook(r) {{ }}",
                selector
            );
            assert!(
                matches!(parse(&source), Err(ExtensionParseError::InvalidSelector { .. })),
                "selector {} should be rejected",
                selector
            );
        }
    }

    #[test]
    fn test_selector_evaluated_before_body_runs() {
        // the body throws, but selector validation fails first
        let err = parse(
            r#"
            throw "body ran";
            fn A__id() { "a" }
            fn A__selector() { ["nope:Nope"] }
            fn A__request_hook(request) { }
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, ExtensionParseError::UnknownOperation { .. }));
    }

    #[test]
    fn test_invalid_and_duplicate_ids() {
        let bad = parse(
            r#"
            fn id() { "-bad id" }
            fn selector() { ["svc1:Ping"] }
            fn request_hook(request) { }
        "#,
        )
        .unwrap_err();
        assert!(matches!(bad, ExtensionParseError::InvalidId { .. }));

        let duplicate = parse(
            r#"
            fn A__id() { "same" }
            fn A__selector() { ["svc1:Ping"] }
            fn A__request_hook(request) { }
            fn B__id() { "same" }
            fn B__selector() { ["svc1:Ping"] }
            fn B__request_hook(request) { }
        "#,
        )
        .unwrap_err();
        assert!(matches!(duplicate, ExtensionParseError::InvalidId { .. }));
    }

    #[test]
    fn test_hook_signature_checked() {
        let err = parse(
            r#"
            fn id() { "a" }
            fn selector() { ["svc1:Ping"] }
            fn response_hook(body) { }
        "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ExtensionParseError::InvalidHookSignature { expected: 3, .. }
        ));
    }

    #[test]
    fn test_parse_file_and_io_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(AUDIT.as_bytes()).unwrap();
        let parser = ExtensionParser::new(catalog());
        assert_eq!(parser.parse_file(file.path()).unwrap().len(), 2);

        let missing = parser.parse_file("/definitely/not/here.rhai");
        assert!(matches!(missing, Err(ExtensionParseError::Io { .. })));
    }
}
