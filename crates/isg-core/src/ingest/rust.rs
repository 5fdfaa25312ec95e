//! Rust indexer using syn for AST-based extraction.
//!
//! Extracts:
//! - Level-1 items: free functions, structs, enums, traits, impl blocks,
//!   type aliases, constants and statics, modules, cargo features
//! - Level-2 items: impl and trait methods, struct fields, enum variants
//! - Level-3 items: named fields of enum variants
//! - Edges: calls, trait implementations, impl self types, signature type
//!   usage, generic bounds and `#[cfg(feature = "...")]` gates
//!
//! References are collected per file by name and resolved once every file
//! of the tree has been read.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use ignore::WalkBuilder;
use proc_macro2::Span;
use quote::{quote, ToTokens};
use regex::Regex;
use syn::{
    spanned::Spanned, visit::Visit, Attribute, Block, FnArg, Generics, ImplItem, Item, ItemConst,
    ItemEnum, ItemFn, ItemImpl, ItemMod, ItemStatic, ItemStruct, ItemTrait, ItemType, ReturnType,
    Signature, TraitItem, Type, TypeParamBound, Visibility, WherePredicate,
};
use tracing::{debug, info, warn};

use super::IngestError;
use crate::graph::{
    Edge, EdgeKind, IngestBatch, IngestNode, InterfaceNode, Level, NodeKey, NodeKind, SourceSpan, Tag,
};

const MANIFEST: &str = "Cargo.toml";
const FEATURE_PATTERN: &str = r#"feature\s*=\s*"([^"]+)""#;

/// Result of indexing a directory tree.
#[derive(Debug, Clone, Default)]
pub struct IndexedTree {
    pub batch: IngestBatch,
    /// Files that contributed nodes.
    pub files: usize,
    /// Files skipped because they failed to read or parse.
    pub skipped: Vec<String>,
}

/// Rust source indexer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustIndexer;

impl RustIndexer {
    pub fn new() -> Self {
        Self
    }

    /// Index every `.rs` file and `Cargo.toml` under `root`.
    ///
    /// Walks with gitignore rules and skips `target/`. A file that fails to
    /// parse is logged and skipped; the rest of the tree is still indexed.
    pub fn index_directory(&self, root: &Path) -> Result<IndexedTree, IngestError> {
        let walker = WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .filter_entry(|entry| entry.file_name() != "target")
            .build();

        let mut paths = Vec::new();
        for entry in walker.flatten() {
            let path = entry.path();
            if path.is_file() && is_indexable(path) {
                paths.push(path.to_path_buf());
            }
        }
        paths.sort();

        let mut tree = IndexedTree::default();
        let mut sources = Vec::new();
        let mut manifests = Vec::new();

        for path in paths {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");

            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %relative, error = %e, "Failed to read file");
                    tree.skipped.push(relative);
                    continue;
                }
            };

            let parsed = if relative.ends_with(MANIFEST) {
                parse_manifest(&relative, &content).map(|m| manifests.push(m))
            } else {
                parse_source(&relative, &content).map(|s| sources.push(s))
            };
            match parsed {
                Ok(()) => tree.files += 1,
                Err(e) => {
                    warn!(file = %relative, error = %e, "Skipping file");
                    tree.skipped.push(relative);
                }
            }
        }

        tree.batch = link(sources, manifests);
        info!(
            files = tree.files,
            skipped = tree.skipped.len(),
            nodes = tree.batch.nodes.len(),
            edges = tree.batch.edges.len(),
            "Indexed directory"
        );
        Ok(tree)
    }

    /// Index in-memory sources given as `(relative path, content)` pairs.
    ///
    /// Unlike [`index_directory`](Self::index_directory) a parse error fails
    /// the whole call.
    pub fn index_sources<'a, I>(&self, files: I) -> Result<IngestBatch, IngestError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut sources = Vec::new();
        let mut manifests = Vec::new();
        for (path, content) in files {
            if path.ends_with(MANIFEST) {
                manifests.push(parse_manifest(path, content)?);
            } else {
                sources.push(parse_source(path, content)?);
            }
        }
        Ok(link(sources, manifests))
    }
}

fn is_indexable(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "rs") || path.file_name().is_some_and(|n| n == MANIFEST)
}

// ============================================================================
// Per-file extraction
// ============================================================================

/// Unresolved reference from a node to a named item.
#[derive(Debug, Clone)]
struct Reference {
    from: NodeKey,
    target: String,
    /// Type the target should belong to (`Type::f`, `self.f()`).
    owner: Option<String>,
    /// Do not fall back to name-only resolution when `owner` misses.
    strict: bool,
    kind: EdgeKind,
}

/// Everything read from one source file.
#[derive(Debug, Default)]
struct SourceIndex {
    file: String,
    nodes: Vec<IngestNode>,
    references: Vec<Reference>,
    /// Methods and the type or trait they belong to.
    owners: Vec<(NodeKey, String)>,
}

/// Feature nodes declared by one manifest.
#[derive(Debug, Default)]
struct ManifestIndex {
    /// Directory of the manifest, `""` for the root.
    dir: String,
    features: HashMap<String, NodeKey>,
    nodes: Vec<IngestNode>,
}

fn parse_source(path: &str, content: &str) -> Result<SourceIndex, IngestError> {
    let syntax = syn::parse_file(content).map_err(|e| IngestError::Parse {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    let mut visitor = RustVisitor::new(path, content);
    visitor.visit_file(&syntax);
    debug!(file = path, nodes = visitor.index.nodes.len(), "Parsed source");
    Ok(visitor.index)
}

fn parse_manifest(path: &str, content: &str) -> Result<ManifestIndex, IngestError> {
    let manifest: toml::Table = content.parse().map_err(|e: toml::de::Error| IngestError::Parse {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    let dir = path
        .strip_suffix(MANIFEST)
        .unwrap_or_default()
        .trim_end_matches('/')
        .to_string();
    let mut index = ManifestIndex {
        dir,
        ..Default::default()
    };

    let Some(features) = manifest.get("features").and_then(|f| f.as_table()) else {
        return Ok(index);
    };
    let scope = ["feature".to_string()];
    for (name, enables) in features {
        let key = NodeKey::derive(path, &scope, name);
        let node = InterfaceNode::new(key.clone(), NodeKind::Feature, format!("feature \"{name}\""));
        index.nodes.push(IngestNode::new(node, format!("{name} = {enables}")));
        index.features.insert(name.clone(), key);
    }
    Ok(index)
}

/// Visitor that extracts nodes and references from one Rust file.
struct RustVisitor<'a> {
    file: &'a str,
    lines: Vec<&'a str>,
    /// Enclosing inline modules.
    scope: Vec<String>,
    seen: HashSet<NodeKey>,
    index: SourceIndex,
}

impl<'a> RustVisitor<'a> {
    fn new(file: &'a str, content: &'a str) -> Self {
        Self {
            file,
            lines: content.lines().collect(),
            scope: Vec::new(),
            seen: HashSet::new(),
            index: SourceIndex {
                file: file.to_string(),
                ..Default::default()
            },
        }
    }

    fn top_key(&self, name: &str) -> NodeKey {
        NodeKey::derive(self.file, &self.scope, name)
    }

    /// `key`, or `key#2`, `key#3`... when already taken in this file.
    fn unique(&mut self, key: NodeKey) -> NodeKey {
        if self.seen.insert(key.clone()) {
            return key;
        }
        let mut n = 2;
        loop {
            let candidate = NodeKey::new(format!("{key}#{n}"));
            if self.seen.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    fn make_node(
        &mut self,
        key: NodeKey,
        kind: NodeKind,
        signature: String,
        attrs: &[Attribute],
        span: Span,
    ) -> InterfaceNode {
        let key = self.unique(key);
        let start = span.start().line.max(1);
        let end = span.end().line.max(start);
        let mut node = InterfaceNode::new(key, kind, signature)
            .with_span(SourceSpan::new(self.file, start, end));
        if let Some(doc) = doc_comment(attrs) {
            node = node.with_doc(doc);
        }
        if is_test(attrs) {
            node = node.with_tag(Tag::Test);
        }
        for feature in gated_features(attrs) {
            self.refer(&node.key, feature, EdgeKind::FeatureGatedBy);
        }
        node
    }

    fn push(&mut self, node: InterfaceNode) {
        let code = node
            .span
            .as_ref()
            .map(|s| self.code(s.start_line, s.end_line))
            .unwrap_or_default();
        self.index.nodes.push(IngestNode::new(node, code));
    }

    fn code(&self, start_line: usize, end_line: usize) -> String {
        let start = start_line.saturating_sub(1);
        let end = end_line.min(self.lines.len());
        if start >= end {
            return String::new();
        }
        self.lines[start..end].join("\n")
    }

    fn refer(&mut self, from: &NodeKey, target: String, kind: EdgeKind) {
        self.index.references.push(Reference {
            from: from.clone(),
            target,
            owner: None,
            strict: false,
            kind,
        });
    }

    fn refer_types(&mut self, from: &NodeKey, ty: &Type, kind: EdgeKind) {
        let mut names = TypeNames::default();
        names.visit_type(ty);
        for name in names.0 {
            self.refer(from, name, kind);
        }
    }

    fn refer_signature(&mut self, from: &NodeKey, sig: &Signature) {
        for input in &sig.inputs {
            if let FnArg::Typed(arg) = input {
                self.refer_types(from, &arg.ty, EdgeKind::Uses);
            }
        }
        if let ReturnType::Type(_, ty) = &sig.output {
            self.refer_types(from, ty, EdgeKind::Uses);
        }
        self.refer_bounds(from, &sig.generics);
    }

    fn refer_bounds(&mut self, from: &NodeKey, generics: &Generics) {
        for name in bound_names(generics) {
            self.refer(from, name, EdgeKind::RequiresBound);
        }
    }

    /// Calls made inside `block`. `owner` is the type of the enclosing impl
    /// or trait, used for `Self::f()` and `self.f()`.
    fn refer_calls(&mut self, from: &NodeKey, block: &Block, owner: Option<&str>) {
        let mut extractor = CallExtractor::default();
        extractor.visit_block(block);

        for call in extractor.calls {
            let (target_owner, strict) = match call.qualifier.as_deref() {
                Some("Self") => (owner.map(str::to_string), true),
                Some(q) if starts_uppercase(q) => (Some(q.to_string()), true),
                Some(_) => (None, false),
                None if call.method => (owner.map(str::to_string), false),
                None => (None, false),
            };
            self.index.references.push(Reference {
                from: from.clone(),
                target: call.name,
                owner: target_owner,
                strict,
                kind: EdgeKind::Calls,
            });
        }
    }

    fn method(
        &mut self,
        parent: &NodeKey,
        owner: &str,
        sig: &Signature,
        vis_public: bool,
        attrs: &[Attribute],
        span: Span,
        body: Option<&Block>,
    ) {
        let name = sig.ident.to_string();
        let mut node = self
            .make_node(parent.child(&name), NodeKind::Method, tidy(quote!(#sig)), attrs, span)
            .nested(parent.clone(), Level::L2);
        if vis_public {
            node = node.with_tag(Tag::Public);
        }
        node = with_signature_tags(node, sig);

        let key = node.key.clone();
        self.index.owners.push((key.clone(), owner.to_string()));
        self.refer_signature(&key, sig);
        if let Some(block) = body {
            self.refer_calls(&key, block, Some(owner));
        }
        self.push(node);
    }

    fn process_function(&mut self, item: &ItemFn) {
        let name = item.sig.ident.to_string();
        let (vis, sig) = (&item.vis, &item.sig);
        let node = self.make_node(
            self.top_key(&name),
            NodeKind::Function,
            tidy(quote!(#vis #sig)),
            &item.attrs,
            item.span(),
        );
        let node = with_signature_tags(with_visibility(node, vis), sig);

        let key = node.key.clone();
        self.refer_signature(&key, sig);
        self.refer_calls(&key, &item.block, None);
        self.push(node);
    }

    fn process_struct(&mut self, item: &ItemStruct) {
        let name = item.ident.to_string();
        let (vis, ident, generics) = (&item.vis, &item.ident, &item.generics);
        let node = self.make_node(
            self.top_key(&name),
            NodeKind::Struct,
            tidy(quote!(#vis struct #ident #generics)),
            &item.attrs,
            item.span(),
        );
        let node = with_visibility(node, vis);
        let key = node.key.clone();
        self.refer_bounds(&key, generics);

        for (i, field) in item.fields.iter().enumerate() {
            let field_name = field
                .ident
                .as_ref()
                .map_or_else(|| i.to_string(), |id| id.to_string());
            let (fvis, ty) = (&field.vis, &field.ty);
            let signature = match &field.ident {
                Some(id) => tidy(quote!(#fvis #id: #ty)),
                None => tidy(quote!(#fvis #ty)),
            };
            let child = self
                .make_node(key.child(&field_name), NodeKind::Field, signature, &field.attrs, field.span())
                .nested(key.clone(), Level::L2);
            let child = with_visibility(child, fvis);
            self.refer_types(&key, ty, EdgeKind::Uses);
            self.push(child);
        }

        self.push(node);
    }

    fn process_enum(&mut self, item: &ItemEnum) {
        let name = item.ident.to_string();
        let (vis, ident, generics) = (&item.vis, &item.ident, &item.generics);
        let node = self.make_node(
            self.top_key(&name),
            NodeKind::Enum,
            tidy(quote!(#vis enum #ident #generics)),
            &item.attrs,
            item.span(),
        );
        let node = with_visibility(node, vis);
        let key = node.key.clone();
        self.refer_bounds(&key, generics);

        for variant in &item.variants {
            let (vident, fields) = (&variant.ident, &variant.fields);
            let variant_node = self
                .make_node(
                    key.child(&vident.to_string()),
                    NodeKind::Variant,
                    tidy(quote!(#vident #fields)),
                    &variant.attrs,
                    variant.span(),
                )
                .nested(key.clone(), Level::L2);
            let variant_key = variant_node.key.clone();

            for field in fields {
                self.refer_types(&key, &field.ty, EdgeKind::Uses);
                let Some(fident) = &field.ident else {
                    continue;
                };
                let ty = &field.ty;
                let child = self
                    .make_node(
                        variant_key.child(&fident.to_string()),
                        NodeKind::Field,
                        tidy(quote!(#fident: #ty)),
                        &field.attrs,
                        field.span(),
                    )
                    .nested(variant_key.clone(), Level::L3);
                self.push(child);
            }
            self.push(variant_node);
        }

        self.push(node);
    }

    fn process_trait(&mut self, item: &ItemTrait) {
        let name = item.ident.to_string();
        let (vis, unsafety, ident, generics) = (&item.vis, &item.unsafety, &item.ident, &item.generics);
        let header = if item.supertraits.is_empty() {
            quote!(#vis #unsafety trait #ident #generics)
        } else {
            let supertraits = &item.supertraits;
            quote!(#vis #unsafety trait #ident #generics: #supertraits)
        };
        let mut node = self.make_node(
            self.top_key(&name),
            NodeKind::Trait,
            tidy(header),
            &item.attrs,
            item.span(),
        );
        node = with_visibility(node, vis);
        if item.unsafety.is_some() {
            node = node.with_tag(Tag::Unsafe);
        }
        let public = node.has_tag(Tag::Public);
        let key = node.key.clone();

        self.refer_bounds(&key, generics);
        for bound in &item.supertraits {
            if let Some(name) = bound_name(bound) {
                self.refer(&key, name, EdgeKind::RequiresBound);
            }
        }

        for trait_item in &item.items {
            if let TraitItem::Fn(m) = trait_item {
                self.method(&key, &name, &m.sig, public, &m.attrs, m.span(), m.default.as_ref());
            }
        }

        self.push(node);
    }

    fn process_impl(&mut self, item: &ItemImpl) {
        let self_name = type_name(&item.self_ty);
        let trait_name = item
            .trait_
            .as_ref()
            .and_then(|(_, path, _)| path.segments.last())
            .map(|s| s.ident.to_string());
        let segment = match &trait_name {
            Some(t) => format!("impl {t} for {self_name}"),
            None => format!("impl {self_name}"),
        };

        let (unsafety, generics, self_ty) = (&item.unsafety, &item.generics, &item.self_ty);
        let header = match &item.trait_ {
            Some((bang, path, _)) => quote!(#unsafety impl #generics #bang #path for #self_ty),
            None => quote!(#unsafety impl #generics #self_ty),
        };
        let mut node = self.make_node(
            self.top_key(&segment),
            NodeKind::Impl,
            tidy(header),
            &item.attrs,
            item.span(),
        );
        if item.unsafety.is_some() {
            node = node.with_tag(Tag::Unsafe);
        }
        let key = node.key.clone();

        if let Some(trait_name) = trait_name {
            self.refer(&key, trait_name, EdgeKind::Implements);
        }
        self.refer(&key, self_name.clone(), EdgeKind::DependsOn);
        self.refer_bounds(&key, generics);

        for impl_item in &item.items {
            if let ImplItem::Fn(m) = impl_item {
                let public = matches!(m.vis, Visibility::Public(_));
                self.method(&key, &self_name, &m.sig, public, &m.attrs, m.span(), Some(&m.block));
            }
        }

        self.push(node);
    }

    fn process_type_alias(&mut self, item: &ItemType) {
        let name = item.ident.to_string();
        let (vis, ident, generics, ty) = (&item.vis, &item.ident, &item.generics, &item.ty);
        let node = self.make_node(
            self.top_key(&name),
            NodeKind::TypeAlias,
            tidy(quote!(#vis type #ident #generics = #ty)),
            &item.attrs,
            item.span(),
        );
        let node = with_visibility(node, vis);
        let key = node.key.clone();
        self.refer_types(&key, ty, EdgeKind::Uses);
        self.push(node);
    }

    fn process_const(&mut self, item: &ItemConst) {
        let name = item.ident.to_string();
        let (vis, ident, ty) = (&item.vis, &item.ident, &item.ty);
        let node = self.make_node(
            self.top_key(&name),
            NodeKind::Constant,
            tidy(quote!(#vis const #ident: #ty)),
            &item.attrs,
            item.span(),
        );
        let node = with_visibility(node, vis);
        let key = node.key.clone();
        self.refer_types(&key, ty, EdgeKind::Uses);
        self.push(node);
    }

    fn process_static(&mut self, item: &ItemStatic) {
        let name = item.ident.to_string();
        let (vis, mutability, ident, ty) = (&item.vis, &item.mutability, &item.ident, &item.ty);
        let node = self.make_node(
            self.top_key(&name),
            NodeKind::Constant,
            tidy(quote!(#vis static #mutability #ident: #ty)),
            &item.attrs,
            item.span(),
        );
        let node = with_visibility(node, vis);
        let key = node.key.clone();
        self.refer_types(&key, ty, EdgeKind::Uses);
        self.push(node);
    }

    fn process_mod(&mut self, item: &ItemMod) {
        let name = item.ident.to_string();
        let (vis, ident) = (&item.vis, &item.ident);
        let node = self.make_node(
            self.top_key(&name),
            NodeKind::Module,
            tidy(quote!(#vis mod #ident)),
            &item.attrs,
            item.span(),
        );
        let node = with_visibility(node, vis);
        self.push(node);

        if let Some((_, items)) = &item.content {
            self.scope.push(name);
            for inner in items {
                self.visit_item(inner);
            }
            self.scope.pop();
        }
    }
}

impl<'ast> Visit<'ast> for RustVisitor<'_> {
    fn visit_item(&mut self, item: &'ast Item) {
        match item {
            Item::Fn(f) => self.process_function(f),
            Item::Struct(s) => self.process_struct(s),
            Item::Enum(e) => self.process_enum(e),
            Item::Trait(t) => self.process_trait(t),
            Item::Impl(i) => self.process_impl(i),
            Item::Type(t) => self.process_type_alias(t),
            Item::Const(c) => self.process_const(c),
            Item::Static(s) => self.process_static(s),
            Item::Mod(m) => self.process_mod(m),
            // use declarations, macros, extern crates
            _ => {}
        }
    }
}

/// A call expression inside a body.
#[derive(Debug)]
struct Call {
    name: String,
    /// Second to last path segment of `a::b::f()`.
    qualifier: Option<String>,
    method: bool,
}

/// Visitor that extracts function and method calls from a code block.
#[derive(Debug, Default)]
struct CallExtractor {
    calls: Vec<Call>,
}

impl<'ast> Visit<'ast> for CallExtractor {
    fn visit_expr_call(&mut self, node: &'ast syn::ExprCall) {
        if let syn::Expr::Path(path) = &*node.func {
            let mut segments = path.path.segments.iter().rev();
            if let Some(last) = segments.next() {
                self.calls.push(Call {
                    name: last.ident.to_string(),
                    qualifier: segments.next().map(|s| s.ident.to_string()),
                    method: false,
                });
            }
        }
        syn::visit::visit_expr_call(self, node);
    }

    fn visit_expr_method_call(&mut self, node: &'ast syn::ExprMethodCall) {
        self.calls.push(Call {
            name: node.method.to_string(),
            qualifier: None,
            method: true,
        });
        syn::visit::visit_expr_method_call(self, node);
    }
}

/// Collects the last segment of every path inside a type.
#[derive(Debug, Default)]
struct TypeNames(Vec<String>);

impl<'ast> Visit<'ast> for TypeNames {
    fn visit_path(&mut self, path: &'ast syn::Path) {
        if let Some(last) = path.segments.last() {
            self.0.push(last.ident.to_string());
        }
        syn::visit::visit_path(self, path);
    }
}

// ============================================================================
// Attribute and token helpers
// ============================================================================

fn doc_comment(attrs: &[Attribute]) -> Option<String> {
    let doc_lines: Vec<String> = attrs
        .iter()
        .filter_map(|attr| {
            if attr.path().is_ident("doc") {
                if let syn::Meta::NameValue(nv) = &attr.meta {
                    if let syn::Expr::Lit(lit) = &nv.value {
                        if let syn::Lit::Str(s) = &lit.lit {
                            return Some(s.value().trim().to_string());
                        }
                    }
                }
            }
            None
        })
        .collect();

    if doc_lines.is_empty() {
        None
    } else {
        Some(doc_lines.join("\n"))
    }
}

/// `#[test]`, `#[tokio::test]` and friends.
fn is_test(attrs: &[Attribute]) -> bool {
    attrs
        .iter()
        .any(|attr| attr.path().segments.last().is_some_and(|s| s.ident == "test"))
}

fn feature_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FEATURE_PATTERN).ok()).as_ref()
}

/// Feature names in `#[cfg(...)]` attributes, including `all`/`any` nesting.
fn gated_features(attrs: &[Attribute]) -> Vec<String> {
    let Some(re) = feature_regex() else {
        return Vec::new();
    };
    let mut features = BTreeSet::new();
    for attr in attrs.iter().filter(|a| a.path().is_ident("cfg")) {
        let tokens = attr.to_token_stream().to_string();
        for capture in re.captures_iter(&tokens) {
            features.insert(capture[1].to_string());
        }
    }
    features.into_iter().collect()
}

fn with_visibility(node: InterfaceNode, vis: &Visibility) -> InterfaceNode {
    match vis {
        Visibility::Public(_) => node.with_tag(Tag::Public),
        _ => node,
    }
}

fn with_signature_tags(mut node: InterfaceNode, sig: &Signature) -> InterfaceNode {
    if sig.asyncness.is_some() {
        node = node.with_tag(Tag::Async);
    }
    if sig.unsafety.is_some() {
        node = node.with_tag(Tag::Unsafe);
    }
    node
}

fn bound_name(bound: &TypeParamBound) -> Option<String> {
    match bound {
        TypeParamBound::Trait(t) => t.path.segments.last().map(|s| s.ident.to_string()),
        _ => None,
    }
}

/// Trait names in generic bounds and where clauses.
fn bound_names(generics: &Generics) -> Vec<String> {
    let mut names = Vec::new();
    for param in generics.type_params() {
        names.extend(param.bounds.iter().filter_map(bound_name));
    }
    if let Some(where_clause) = &generics.where_clause {
        for predicate in &where_clause.predicates {
            if let WherePredicate::Type(p) = predicate {
                names.extend(p.bounds.iter().filter_map(bound_name));
            }
        }
    }
    names
}

fn type_name(ty: &Type) -> String {
    match ty {
        Type::Path(p) => p
            .path
            .segments
            .last()
            .map(|s| s.ident.to_string())
            .unwrap_or_default(),
        Type::Reference(r) => type_name(&r.elem),
        Type::Paren(p) => type_name(&p.elem),
        Type::Group(g) => type_name(&g.elem),
        other => tidy(quote!(#other)),
    }
}

fn starts_uppercase(s: &str) -> bool {
    s.chars().next().is_some_and(char::is_uppercase)
}

/// Collapse the spacing `quote` puts between tokens.
fn tidy(tokens: proc_macro2::TokenStream) -> String {
    let mut text = tokens.to_string();
    for (from, to) in [
        (" :: ", "::"),
        (":: ", "::"),
        (" ::", "::"),
        (" < ", "<"),
        ("< ", "<"),
        (" >", ">"),
        (" (", "("),
        ("( ", "("),
        (" )", ")"),
        (" ,", ","),
        (" : ", ": "),
        (" ;", ";"),
        ("& ", "&"),
        ("# ", "#"),
        ("[ ", "["),
        (" ]", "]"),
    ] {
        text = text.replace(from, to);
    }
    text
}

// ============================================================================
// Cross-file linking
// ============================================================================

fn accepts(edge: EdgeKind, kind: NodeKind) -> bool {
    match edge {
        EdgeKind::Calls => matches!(kind, NodeKind::Function | NodeKind::Method),
        EdgeKind::Implements | EdgeKind::RequiresBound => kind == NodeKind::Trait,
        EdgeKind::DependsOn | EdgeKind::Uses => matches!(
            kind,
            NodeKind::Struct | NodeKind::Enum | NodeKind::Trait | NodeKind::TypeAlias
        ),
        EdgeKind::FeatureGatedBy => kind == NodeKind::Feature,
    }
}

/// Name index over every node of the tree.
struct Linker<'a> {
    by_name: HashMap<&'a str, Vec<&'a InterfaceNode>>,
    owners: HashMap<&'a NodeKey, &'a str>,
}

impl<'a> Linker<'a> {
    fn new(sources: &'a [SourceIndex]) -> Self {
        let mut by_name: HashMap<&str, Vec<&InterfaceNode>> = HashMap::new();
        let mut owners = HashMap::new();
        for source in sources {
            for item in &source.nodes {
                let name = item.node.key.name();
                let name = name.split('#').next().unwrap_or(name);
                by_name.entry(name).or_default().push(&item.node);
            }
            for (key, owner) in &source.owners {
                owners.insert(key, owner.as_str());
            }
        }
        Self { by_name, owners }
    }

    /// Owner match first, then a unique match in the same file, then a
    /// unique match anywhere. Ambiguous names stay unresolved.
    fn resolve(&self, file: &str, reference: &Reference) -> Option<NodeKey> {
        let candidates: Vec<&InterfaceNode> = self
            .by_name
            .get(reference.target.as_str())?
            .iter()
            .copied()
            .filter(|n| accepts(reference.kind, n.kind))
            .collect();

        if let Some(owner) = &reference.owner {
            let owned: Vec<&&InterfaceNode> = candidates
                .iter()
                .filter(|n| self.owners.get(&n.key).is_some_and(|o| *o == owner.as_str()))
                .collect();
            if let [only] = owned.as_slice() {
                return Some(only.key.clone());
            }
            if reference.strict {
                return None;
            }
        }

        let local: Vec<&&InterfaceNode> = candidates
            .iter()
            .filter(|n| n.span.as_ref().is_some_and(|s| s.file == file))
            .collect();
        match local.as_slice() {
            [only] => return Some(only.key.clone()),
            [] => {}
            _ => return None,
        }

        match candidates.as_slice() {
            [only] => Some(only.key.clone()),
            _ => None,
        }
    }
}

/// Nearest manifest whose directory contains `file`.
fn manifest_for<'a>(manifests: &'a [ManifestIndex], file: &str) -> Option<&'a ManifestIndex> {
    manifests
        .iter()
        .filter(|m| m.dir.is_empty() || file.starts_with(&format!("{}/", m.dir)))
        .max_by_key(|m| m.dir.len())
}

fn link(sources: Vec<SourceIndex>, manifests: Vec<ManifestIndex>) -> IngestBatch {
    let linker = Linker::new(&sources);
    let mut edges = BTreeSet::new();
    let mut unresolved = 0usize;

    for source in &sources {
        for reference in &source.references {
            let target = if reference.kind == EdgeKind::FeatureGatedBy {
                manifest_for(&manifests, &source.file)
                    .and_then(|m| m.features.get(&reference.target))
                    .cloned()
            } else {
                linker.resolve(&source.file, reference)
            };
            match target {
                Some(to) if to != reference.from => {
                    edges.insert(Edge::new(reference.from.clone(), to, reference.kind));
                }
                Some(_) => {}
                None => unresolved += 1,
            }
        }
    }
    debug!(edges = edges.len(), unresolved, "Linked references");

    let mut nodes: Vec<IngestNode> = manifests.into_iter().flat_map(|m| m.nodes).collect();
    nodes.extend(sources.into_iter().flat_map(|s| s.nodes));
    IngestBatch {
        nodes,
        edges: edges.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;

    const MANIFEST_SRC: &str = r#"
[package]
name = "demo"
version = "0.1.0"

[features]
default = []
fast = []
"#;

    const LIB: &str = r#"
/// Loads things.
pub trait Loader: Send {
    fn load(&self) -> Config;
}

pub struct Config {
    pub name: String,
    retries: u32,
}

pub enum Event {
    Started,
    Failed { code: u32, reason: String },
}

pub struct FileLoader;

impl Loader for FileLoader {
    fn load(&self) -> Config {
        self.parse()
    }
}

impl FileLoader {
    fn parse(&self) -> Config {
        defaults()
    }
}

fn defaults() -> Config {
    Config { name: String::new(), retries: 3 }
}

pub async fn run<L: Loader>(loader: L) -> Config {
    loader.load()
}

#[cfg(feature = "fast")]
pub fn fast_path() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_loads() {
        defaults();
    }
}
"#;

    const MAIN: &str = r#"
fn main() {
    demo::defaults();
}
"#;

    fn index() -> IngestBatch {
        RustIndexer::new()
            .index_sources([("Cargo.toml", MANIFEST_SRC), ("src/lib.rs", LIB), ("src/main.rs", MAIN)])
            .unwrap()
    }

    fn node<'a>(batch: &'a IngestBatch, key: &str) -> &'a IngestNode {
        batch
            .nodes
            .iter()
            .find(|n| n.node.key.as_str() == key)
            .unwrap_or_else(|| panic!("missing node {key}"))
    }

    fn has_edge(batch: &IngestBatch, from: &str, to: &str, kind: EdgeKind) -> bool {
        batch
            .edges
            .iter()
            .any(|e| e.from.as_str() == from && e.to.as_str() == to && e.kind == kind)
    }

    #[test]
    fn test_levels_and_parents() {
        let batch = index();

        let config = node(&batch, "src/lib.rs::Config");
        assert_eq!(config.node.kind, NodeKind::Struct);
        assert_eq!(config.node.level, Level::L1);
        assert!(config.code.contains("retries: u32"));

        let field = node(&batch, "src/lib.rs::Config::name");
        assert_eq!(field.node.level, Level::L2);
        assert_eq!(field.node.parent, Some(NodeKey::from("src/lib.rs::Config")));
        assert!(field.node.has_tag(Tag::Public));

        let variant = node(&batch, "src/lib.rs::Event::Failed");
        assert_eq!(variant.node.kind, NodeKind::Variant);
        let code = node(&batch, "src/lib.rs::Event::Failed::code");
        assert_eq!(code.node.level, Level::L3);

        let method = node(&batch, "src/lib.rs::impl Loader for FileLoader::load");
        assert_eq!(method.node.kind, NodeKind::Method);
        assert_eq!(method.node.level, Level::L2);
        node(&batch, "src/lib.rs::Loader::load");

        let feature = node(&batch, "Cargo.toml::feature::fast");
        assert_eq!(feature.node.kind, NodeKind::Feature);
    }

    #[test]
    fn test_tags_and_docs() {
        let batch = index();

        let run = node(&batch, "src/lib.rs::run");
        assert!(run.node.has_tag(Tag::Async));
        assert!(run.node.has_tag(Tag::Public));
        assert!(run.node.signature.contains("fn run"));

        let test = node(&batch, "src/lib.rs::tests::it_loads");
        assert!(test.node.has_tag(Tag::Test));
        assert!(!node(&batch, "src/lib.rs::defaults").node.has_tag(Tag::Public));

        let loader = node(&batch, "src/lib.rs::Loader");
        assert_eq!(loader.node.doc.as_deref(), Some("Loads things."));
        assert!(loader.node.span.as_ref().is_some_and(|s| s.file == "src/lib.rs" && s.len() > 1));
    }

    #[test]
    fn test_edges_resolve() {
        let batch = index();
        let lib = |name: &str| format!("src/lib.rs::{name}");

        assert!(has_edge(&batch, &lib("impl Loader for FileLoader"), &lib("Loader"), EdgeKind::Implements));
        assert!(has_edge(&batch, &lib("impl Loader for FileLoader"), &lib("FileLoader"), EdgeKind::DependsOn));
        assert!(has_edge(
            &batch,
            &lib("impl Loader for FileLoader::load"),
            &lib("impl FileLoader::parse"),
            EdgeKind::Calls
        ));
        assert!(has_edge(&batch, &lib("impl FileLoader::parse"), &lib("defaults"), EdgeKind::Calls));
        assert!(has_edge(&batch, &lib("defaults"), &lib("Config"), EdgeKind::Uses));
        assert!(has_edge(&batch, &lib("run"), &lib("Loader"), EdgeKind::RequiresBound));
        assert!(has_edge(&batch, &lib("tests::it_loads"), &lib("defaults"), EdgeKind::Calls));
        assert!(has_edge(&batch, "src/main.rs::main", &lib("defaults"), EdgeKind::Calls));
        assert!(has_edge(&batch, &lib("fast_path"), "Cargo.toml::feature::fast", EdgeKind::FeatureGatedBy));

        // `String::new()` must not bind to an unrelated function.
        assert!(!batch.edges.iter().any(|e| e.to.name() == "new"));
    }

    #[test]
    fn test_batch_ingests_idempotently() {
        let store = GraphStore::new();
        let first = store.upsert_nodes(index().nodes, index().edges).unwrap();
        assert!(first.version.is_some());

        let again = store.upsert_nodes(index().nodes, index().edges).unwrap();
        assert!(again.is_unchanged());
    }

    #[test]
    fn test_duplicate_impls_get_suffixed_keys() {
        let batch = RustIndexer::new()
            .index_sources([(
                "src/a.rs",
                "struct A;\nimpl A { fn one(&self) {} }\nimpl A { fn two(&self) {} }\n",
            )])
            .unwrap();
        node(&batch, "src/a.rs::impl A::one");
        node(&batch, "src/a.rs::impl A#2::two");
    }

    #[test]
    fn test_parse_error_fails_sources() {
        let result = RustIndexer::new().index_sources([("src/bad.rs", "fn broken( {")]);
        assert!(matches!(result, Err(IngestError::Parse { .. })));
    }

    #[test]
    fn test_index_directory_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), MANIFEST_SRC).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), LIB).unwrap();
        std::fs::write(dir.path().join("src/bad.rs"), "fn broken( {").unwrap();
        std::fs::write(dir.path().join("target/debug/gen.rs"), "fn generated() {}").unwrap();

        let tree = RustIndexer::new().index_directory(dir.path()).unwrap();
        assert_eq!(tree.files, 2);
        assert_eq!(tree.skipped, vec!["src/bad.rs".to_string()]);
        assert!(tree.batch.nodes.iter().any(|n| n.node.key.as_str() == "src/lib.rs::run"));
        assert!(!tree.batch.nodes.iter().any(|n| n.node.key.name() == "generated"));
    }
}
