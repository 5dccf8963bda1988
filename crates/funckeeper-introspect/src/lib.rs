//! Source, doc and import resolution for instrumented functions.
//!
//! [`SourceIntrospector`] re-reads and re-parses the defining file on every
//! call, so records always reflect the source as it is on disk.

use std::path::{Path, PathBuf};

use funckeeper_core::{FunctionMeta, IntrospectError, Introspection, Introspector};
use syn::ext::IdentExt;
use syn::spanned::Spanned;
use syn::visit::Visit;
use syn::{Attribute, Block, Expr, ImplItem, Item, Lit, Meta, Signature, TraitItem, Type, UseTree};

#[derive(Debug, Clone, Default)]
pub struct SourceIntrospector {
    search_roots: Vec<PathBuf>,
}

impl SourceIntrospector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a directory that relative source paths are resolved against,
    /// tried before the crate manifest directory.
    #[must_use]
    pub fn with_search_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.search_roots.push(root.into());
        self
    }

    fn resolve_file(&self, function: &FunctionMeta) -> Result<PathBuf, IntrospectError> {
        let file = Path::new(&function.file);
        let mut candidates = vec![file.to_path_buf()];
        if file.is_relative() {
            candidates.extend(self.search_roots.iter().map(|root| root.join(file)));
            if let Some(manifest_dir) = function.manifest_dir.as_deref() {
                candidates.extend(
                    Path::new(manifest_dir)
                        .ancestors()
                        .map(|ancestor| ancestor.join(file)),
                );
            }
        }

        candidates
            .into_iter()
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| unavailable(function, format!("source file {} not found", function.file)))
    }
}

impl Introspector for SourceIntrospector {
    fn inspect(&self, function: &FunctionMeta) -> Result<Introspection, IntrospectError> {
        let path = self.resolve_file(function)?;
        let text = read_source(function, &path)?;

        let result = match syn::parse_file(&text) {
            Ok(file) => ModuleScope::at_call_site(function, path, text, file)
                .and_then(|scope| locate(function, scope)),
            Err(err) => {
                let scan_error = IntrospectError::DependencyScan {
                    function: function.name.clone(),
                    reason: format!("failed to parse {}: {err}", path.display()),
                };
                tracing::warn!(error = %scan_error, "dependency scan failed");
                let recovered = match function.segments().as_slice() {
                    [fn_name] => lexical_fallback(fn_name, &text),
                    _ => None,
                };
                recovered.ok_or_else(|| {
                    unavailable(function, format!("{} could not be parsed", path.display()))
                })
            }
        };
        // Span locations keep a thread-local copy of every parsed file.
        proc_macro2::extra::invalidate_current_thread_spans();

        result
    }
}

fn unavailable(function: &FunctionMeta, reason: impl Into<String>) -> IntrospectError {
    IntrospectError::SourceUnavailable {
        function: function.name.clone(),
        reason: reason.into(),
    }
}

fn read_source(function: &FunctionMeta, path: &Path) -> Result<String, IntrospectError> {
    std::fs::read_to_string(path)
        .map_err(|err| unavailable(function, format!("failed to read {}: {err}", path.display())))
}

fn locate(function: &FunctionMeta, scope: ModuleScope) -> Result<Introspection, IntrospectError> {
    let segments = function.segments();
    let Some((fn_name, owners)) = segments.split_last() else {
        return Err(unavailable(function, "empty function path"));
    };

    let (scope, type_owner) = scope.follow(function, owners)?;
    let Some(found) = find_fn(scope.items(), fn_name, type_owner.as_deref()) else {
        return Err(unavailable(
            function,
            format!("no fn {} in {}", function.name, scope.path.display()),
        ));
    };

    let mut dependencies = body_imports(found.block);
    dependencies.extend(scope.imports());
    dependencies.sort();
    dependencies.dedup();

    Ok(Introspection {
        source: found.source_text(&scope.text),
        doc: doc_text(found.attrs),
        dependencies,
        module_path: Some(scope.module_path().join("::")),
    })
}

/// One module being searched: a parsed file and the chain of inline `mod`
/// blocks entered inside it.
struct ModuleScope {
    path: PathBuf,
    text: String,
    file: syn::File,
    inline: Vec<String>,
    /// Module path of the file itself, crate name first.
    file_module: Vec<String>,
    /// Directory that `mod name;` declared at the file root loads from.
    child_dir: PathBuf,
}

enum Child {
    Inline,
    File { path: PathBuf, owns_dir: bool },
}

impl ModuleScope {
    /// Scope of the innermost module around the call-site line. The inline
    /// modules found there must match the tail of the call-site module path.
    fn at_call_site(
        function: &FunctionMeta,
        path: PathBuf,
        text: String,
        file: syn::File,
    ) -> Result<Self, IntrospectError> {
        let line = usize::try_from(function.line).unwrap_or(usize::MAX);
        let inline = enclosing_mods(&file.items, line);
        let module: Vec<String> = function
            .module_path
            .split("::")
            .map(str::to_string)
            .collect();

        let file_depth = module.len().saturating_sub(inline.len());
        if file_depth == 0 || module[file_depth..] != inline[..] {
            return Err(unavailable(
                function,
                format!(
                    "line {} of {} is not inside module {}",
                    function.line,
                    path.display(),
                    function.module_path
                ),
            ));
        }

        let file_module = module[..file_depth].to_vec();
        let owns_dir = file_module.len() == 1 || is_mod_rs(&path);
        Ok(Self {
            child_dir: module_dir(&path, owns_dir),
            path,
            text,
            file,
            inline,
            file_module,
        })
    }

    fn open(
        function: &FunctionMeta,
        path: PathBuf,
        file_module: Vec<String>,
        owns_dir: bool,
    ) -> Result<Self, IntrospectError> {
        let text = read_source(function, &path)?;
        let file = syn::parse_file(&text).map_err(|err| {
            unavailable(function, format!("failed to parse {}: {err}", path.display()))
        })?;
        Ok(Self {
            child_dir: module_dir(&path, owns_dir),
            path,
            text,
            file,
            inline: Vec::new(),
            file_module,
        })
    }

    fn items(&self) -> &[Item] {
        let mut items = self.file.items.as_slice();
        for name in &self.inline {
            match inline_mod(items, name) {
                Some(inner) => items = inner,
                None => return &[],
            }
        }
        items
    }

    fn module_path(&self) -> Vec<String> {
        let mut path = self.file_module.clone();
        path.extend(self.inline.iter().cloned());
        path
    }

    /// Walks the owner segments of a function path. A final segment that
    /// names no module is returned as the type owning the method.
    fn follow(
        mut self,
        function: &FunctionMeta,
        owners: &[&str],
    ) -> Result<(Self, Option<String>), IntrospectError> {
        for (idx, owner) in owners.iter().enumerate() {
            match *owner {
                "self" => {}
                "super" => {
                    if self.inline.pop().is_none() {
                        return Err(unavailable(
                            function,
                            format!("super of file module {} is not followed", self.path.display()),
                        ));
                    }
                }
                "crate" => {
                    if self.file_module.len() != 1 {
                        return Err(unavailable(
                            function,
                            format!("{} is not a crate root", self.path.display()),
                        ));
                    }
                    self.inline.clear();
                }
                name => match self.child(name) {
                    Some(Child::Inline) => self.inline.push(name.to_string()),
                    Some(Child::File { path, owns_dir }) => {
                        let mut module = self.module_path();
                        module.push(name.to_string());
                        self = Self::open(function, path, module, owns_dir)?;
                    }
                    None if idx + 1 == owners.len() => {
                        return Ok((self, Some(name.to_string())));
                    }
                    None => {
                        return Err(unavailable(
                            function,
                            format!("no module {name} in {}", self.module_path().join("::")),
                        ));
                    }
                },
            }
        }
        Ok((self, None))
    }

    fn child(&self, name: &str) -> Option<Child> {
        let item_mod = self.items().iter().find_map(|item| match item {
            Item::Mod(item_mod) if item_mod.ident.unraw() == name => Some(item_mod),
            _ => None,
        })?;
        if item_mod.content.is_some() {
            return Some(Child::Inline);
        }

        let mut dir = self.child_dir.clone();
        dir.extend(&self.inline);
        if let Some(custom) = path_attr(&item_mod.attrs) {
            let base = if self.inline.is_empty() {
                self.path.parent().map(Path::to_path_buf).unwrap_or_default()
            } else {
                dir
            };
            return Some(Child::File {
                path: base.join(custom),
                owns_dir: true,
            });
        }

        let flat = dir.join(format!("{name}.rs"));
        let nested = dir.join(name).join("mod.rs");
        if !flat.is_file() && nested.is_file() {
            Some(Child::File {
                path: nested,
                owns_dir: true,
            })
        } else {
            Some(Child::File {
                path: flat,
                owns_dir: false,
            })
        }
    }

    /// File-level imports plus those of each inline module entered.
    fn imports(&self) -> Vec<String> {
        let mut items = self.file.items.as_slice();
        let mut imports = module_imports(items);
        for name in &self.inline {
            let Some(inner) = inline_mod(items, name) else {
                break;
            };
            items = inner;
            imports.extend(module_imports(items));
        }
        imports
    }
}

/// Names of the inline modules whose braces contain `line`, outermost first.
fn enclosing_mods(items: &[Item], line: usize) -> Vec<String> {
    let mut chain = Vec::new();
    let mut items = items;
    loop {
        let next = items.iter().find_map(|item| {
            let Item::Mod(item_mod) = item else {
                return None;
            };
            let (brace, inner) = item_mod.content.as_ref()?;
            let start = item_mod.mod_token.span.start().line;
            let end = brace.span.close().end().line;
            (start..=end)
                .contains(&line)
                .then(|| (item_mod.ident.unraw().to_string(), inner.as_slice()))
        });
        match next {
            Some((name, inner)) => {
                chain.push(name);
                items = inner;
            }
            None => return chain,
        }
    }
}

fn inline_mod<'a>(items: &'a [Item], name: &str) -> Option<&'a [Item]> {
    items.iter().find_map(|item| match item {
        Item::Mod(item_mod) if item_mod.ident.unraw() == name => item_mod
            .content
            .as_ref()
            .map(|(_, inner)| inner.as_slice()),
        _ => None,
    })
}

fn is_mod_rs(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == "mod.rs")
}

/// `src/lib.rs` and `src/a/mod.rs` own their directory; `src/a.rs` keeps its
/// children in `src/a/`.
fn module_dir(path: &Path, owns_dir: bool) -> PathBuf {
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    match path.file_stem() {
        Some(stem) if !owns_dir => parent.join(stem),
        _ => parent,
    }
}

fn path_attr(attrs: &[Attribute]) -> Option<String> {
    attrs
        .iter()
        .filter(|attr| attr.path().is_ident("path"))
        .find_map(|attr| match &attr.meta {
            Meta::NameValue(name_value) => match &name_value.value {
                Expr::Lit(expr) => match &expr.lit {
                    Lit::Str(text) => Some(text.value()),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        })
}

/// A free fn among `items`, or with `type_owner`, a method of an impl of
/// that type or a provided method of that trait.
fn find_fn<'ast>(
    items: &'ast [Item],
    fn_name: &str,
    type_owner: Option<&str>,
) -> Option<FoundFn<'ast>> {
    let Some(owner) = type_owner else {
        return items.iter().find_map(|item| match item {
            Item::Fn(item_fn) if item_fn.sig.ident == fn_name => Some(FoundFn::new(
                &item_fn.attrs,
                &item_fn.sig,
                &item_fn.block,
            )),
            _ => None,
        });
    };

    items.iter().find_map(|item| match item {
        Item::Impl(item_impl) if impl_owner(&item_impl.self_ty).as_deref() == Some(owner) => {
            item_impl.items.iter().find_map(|impl_item| match impl_item {
                ImplItem::Fn(method) if method.sig.ident == fn_name => {
                    Some(FoundFn::new(&method.attrs, &method.sig, &method.block))
                }
                _ => None,
            })
        }
        Item::Trait(item_trait) if item_trait.ident == owner => {
            item_trait.items.iter().find_map(|trait_item| match trait_item {
                TraitItem::Fn(method) if method.sig.ident == fn_name => method
                    .default
                    .as_ref()
                    .map(|block| FoundFn::new(&method.attrs, &method.sig, block)),
                _ => None,
            })
        }
        _ => None,
    })
}

struct FoundFn<'ast> {
    attrs: &'ast [Attribute],
    fn_line: usize,
    block: &'ast Block,
}

impl<'ast> FoundFn<'ast> {
    fn new(attrs: &'ast [Attribute], sig: &Signature, block: &'ast Block) -> Self {
        Self {
            attrs,
            fn_line: sig.fn_token.span.start().line,
            block,
        }
    }

    fn source_text(&self, text: &str) -> String {
        let start = self
            .attrs
            .iter()
            .map(|attr| attr.span().start().line)
            .chain(std::iter::once(self.fn_line))
            .min()
            .unwrap_or(self.fn_line);
        let end = self.block.brace_token.span.close().end().line;

        let lines: Vec<&str> = text
            .lines()
            .skip(start.saturating_sub(1))
            .take(end.saturating_sub(start) + 1)
            .collect();
        dedent(&lines.join("\n")).trim().to_string()
    }
}

fn impl_owner(self_ty: &Type) -> Option<String> {
    match self_ty {
        Type::Path(type_path) => type_path
            .path
            .segments
            .last()
            .map(|segment| segment.ident.to_string()),
        _ => None,
    }
}

/// Line-based recovery of a free fn from a file that does not parse. Doc
/// comments and attributes directly above the signature are kept; the body
/// ends where its braces balance, or at end of file.
fn lexical_fallback(fn_name: &str, text: &str) -> Option<Introspection> {
    let lines: Vec<&str> = text.lines().collect();
    let signature = format!("fn {fn_name}");
    let start = lines.iter().position(|line| declares_fn(line, &signature))?;

    let mut first = start;
    while first > 0 && is_fn_preamble(lines[first - 1]) {
        first -= 1;
    }

    let mut end = lines.len() - 1;
    let mut depth = 0_usize;
    let mut opened = false;
    'scan: for (idx, line) in lines.iter().enumerate().skip(start) {
        for ch in line.chars() {
            match ch {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => {
                    depth = depth.saturating_sub(1);
                    if opened && depth == 0 {
                        end = idx;
                        break 'scan;
                    }
                }
                ';' if !opened => {
                    end = idx;
                    break 'scan;
                }
                _ => {}
            }
        }
    }

    let doc_lines: Vec<&str> = lines[first..start]
        .iter()
        .filter_map(|line| line.trim_start().strip_prefix("///"))
        .map(|line| line.strip_prefix(' ').unwrap_or(line))
        .collect();
    let doc = dedent(&doc_lines.join("\n")).trim().to_string();

    Some(Introspection {
        source: dedent(&lines[first..=end].join("\n")).trim().to_string(),
        doc: (!doc.is_empty()).then_some(doc),
        dependencies: Vec::new(),
        module_path: None,
    })
}

fn declares_fn(line: &str, signature: &str) -> bool {
    line.match_indices(signature).any(|(at, _)| {
        let starts_token = line[..at]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace);
        let rest = line[at + signature.len()..].trim_start();
        starts_token && (rest.starts_with('(') || rest.starts_with('<'))
    })
}

fn is_fn_preamble(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("#[")
}

#[derive(Default)]
struct UseCollector {
    imports: Vec<String>,
}

impl<'ast> Visit<'ast> for UseCollector {
    fn visit_item_use(&mut self, node: &'ast syn::ItemUse) {
        flatten_use_tree(&node.tree, &mut Vec::new(), &mut self.imports);
    }

    fn visit_item_extern_crate(&mut self, node: &'ast syn::ItemExternCrate) {
        self.imports.push(node.ident.to_string());
    }
}

fn body_imports(block: &Block) -> Vec<String> {
    let mut collector = UseCollector::default();
    collector.visit_block(block);
    collector.imports
}

/// Top-level imports that precede the first `#[cfg(test)]` item or `fn main`.
fn module_imports(items: &[Item]) -> Vec<String> {
    let mut imports = Vec::new();
    for item in items {
        if is_entry_boundary(item) {
            break;
        }
        match item {
            Item::Use(item_use) => flatten_use_tree(&item_use.tree, &mut Vec::new(), &mut imports),
            Item::ExternCrate(item_crate) => imports.push(item_crate.ident.to_string()),
            _ => {}
        }
    }
    imports
}

fn is_entry_boundary(item: &Item) -> bool {
    if let Item::Fn(item_fn) = item {
        if item_fn.sig.ident == "main" {
            return true;
        }
    }
    item_attrs(item).iter().any(is_cfg_test)
}

fn is_cfg_test(attr: &Attribute) -> bool {
    attr.path().is_ident("cfg")
        && attr
            .parse_args::<syn::Ident>()
            .is_ok_and(|ident| ident == "test")
}

fn item_attrs(item: &Item) -> &[Attribute] {
    match item {
        Item::Const(inner) => &inner.attrs,
        Item::Enum(inner) => &inner.attrs,
        Item::ExternCrate(inner) => &inner.attrs,
        Item::Fn(inner) => &inner.attrs,
        Item::ForeignMod(inner) => &inner.attrs,
        Item::Impl(inner) => &inner.attrs,
        Item::Macro(inner) => &inner.attrs,
        Item::Mod(inner) => &inner.attrs,
        Item::Static(inner) => &inner.attrs,
        Item::Struct(inner) => &inner.attrs,
        Item::Trait(inner) => &inner.attrs,
        Item::TraitAlias(inner) => &inner.attrs,
        Item::Type(inner) => &inner.attrs,
        Item::Union(inner) => &inner.attrs,
        Item::Use(inner) => &inner.attrs,
        _ => &[],
    }
}

/// `use a::{b, c::d as e, f::{self, *}}` yields `a::b`, `a::c::d`, `a::f`
/// and `a::f::*`.
fn flatten_use_tree(tree: &UseTree, prefix: &mut Vec<String>, out: &mut Vec<String>) {
    match tree {
        UseTree::Path(path) => {
            prefix.push(path.ident.to_string());
            flatten_use_tree(&path.tree, prefix, out);
            prefix.pop();
        }
        UseTree::Name(name) => push_import(prefix, &name.ident, out),
        UseTree::Rename(rename) => push_import(prefix, &rename.ident, out),
        UseTree::Glob(_) => {
            prefix.push("*".to_string());
            out.push(prefix.join("::"));
            prefix.pop();
        }
        UseTree::Group(group) => {
            for item in &group.items {
                flatten_use_tree(item, prefix, out);
            }
        }
    }
}

fn push_import(prefix: &[String], ident: &syn::Ident, out: &mut Vec<String>) {
    if ident == "self" {
        if !prefix.is_empty() {
            out.push(prefix.join("::"));
        }
        return;
    }

    let mut path = prefix.to_vec();
    path.push(ident.to_string());
    out.push(path.join("::"));
}

fn doc_text(attrs: &[Attribute]) -> Option<String> {
    let lines: Vec<String> = attrs
        .iter()
        .filter(|attr| attr.path().is_ident("doc"))
        .filter_map(|attr| match &attr.meta {
            Meta::NameValue(name_value) => match &name_value.value {
                Expr::Lit(expr) => match &expr.lit {
                    Lit::Str(text) => Some(text.value()),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        })
        .flat_map(|chunk| {
            chunk
                .lines()
                .map(|line| line.strip_prefix(' ').unwrap_or(line).to_string())
                .collect::<Vec<_>>()
        })
        .collect();

    let doc = dedent(&lines.join("\n")).trim().to_string();
    if doc.is_empty() {
        None
    } else {
        Some(doc)
    }
}

/// Removes the whitespace prefix shared by every non-blank line.
fn dedent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                line.get(indent..).unwrap_or_else(|| line.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
