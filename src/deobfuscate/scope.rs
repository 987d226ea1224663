//! Lexical scope analysis: declarations, hoisting and reference resolution.
//!
//! Two walks over the same tree. The first builds the scope tree and declares
//! every binding in the scope JavaScript hoists it to; the second resolves
//! every identifier occurrence against that tree. Renaming is then done per
//! binding instead of per name.

use std::collections::{HashMap, HashSet};

use tree_sitter::Node;

use crate::deobfuscate::common::{get_node_text, is_function_boundary, walk_tree, TreeVisitor};

pub type ScopeId = usize;
pub type BindingId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Program,
    Function,
    Block,
    Class,
}

#[derive(Debug, Clone)]
struct Scope {
    kind: ScopeKind,
    parent: Option<ScopeId>,
    names: HashMap<String, BindingId>,
}

/// One declared variable
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub scope: ScopeId,
    /// Start byte of the first declaring identifier
    pub decl_start: usize,
    /// Declared by an `export` statement; its name is part of the module interface
    pub exported: bool,
}

/// How an occurrence has to be rewritten to keep its meaning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccurrenceForm {
    /// Bare identifier
    Plain,
    /// `{a}` in an object literal
    ShorthandProperty,
    /// `{a}` in a destructuring pattern
    ShorthandPattern,
    /// `export { a }`
    ExportSpecifier,
    /// `import { a } from ...`
    ImportSpecifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub start: usize,
    pub end: usize,
    pub binding: BindingId,
    pub form: OccurrenceForm,
}

/// Resolved scopes, bindings and occurrences of one tree
#[derive(Debug, Clone, Default)]
pub struct ScopeIndex {
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
    occurrences: Vec<Occurrence>,
    sites: HashMap<usize, (BindingId, OccurrenceForm)>,
    unresolved: HashSet<String>,
    all_names: HashSet<String>,
}

impl ScopeIndex {
    pub fn analyze(root: Node, source: &[u8]) -> Self {
        let mut index = ScopeIndex::default();
        let mut declarations = DeclarationCollector::new(&mut index, root, source);
        walk_tree(root, &mut declarations);
        let scope_of_node = declarations.scope_of_node;

        let mut resolver = ReferenceResolver {
            index: &mut index,
            source,
            scope_of_node: &scope_of_node,
            stack: Vec::new(),
            ancestors: Vec::new(),
        };
        walk_tree(root, &mut resolver);
        index
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn occurrences(&self) -> &[Occurrence] {
        &self.occurrences
    }

    /// Every identifier-like name in the tree, properties and labels included
    pub fn all_names(&self) -> &HashSet<String> {
        &self.all_names
    }

    /// Binding declared by the identifier starting at `start`
    pub fn binding_at(&self, start: usize) -> Option<BindingId> {
        self.sites.get(&start).map(|(id, _)| *id)
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.bindings.iter().any(|b| b.name == name)
    }

    /// Referenced somewhere without any declaration in scope
    pub fn is_unresolved(&self, name: &str) -> bool {
        self.unresolved.contains(name)
    }

    pub fn scope_kind(&self, scope: ScopeId) -> Option<ScopeKind> {
        self.scopes.get(scope).map(|s| s.kind)
    }

    fn new_scope(&mut self, kind: ScopeKind, parent: Option<ScopeId>) -> ScopeId {
        self.scopes.push(Scope {
            kind,
            parent,
            names: HashMap::new(),
        });
        self.scopes.len() - 1
    }

    fn declare(
        &mut self,
        scope: ScopeId,
        node: Node,
        form: OccurrenceForm,
        source: &[u8],
        exported: bool,
    ) -> Option<BindingId> {
        let name = get_node_text(node, source).to_string();
        if name.is_empty() {
            return None;
        }
        let id = match self.scopes[scope].names.get(&name) {
            Some(&id) => id,
            None => {
                self.bindings.push(Binding {
                    name: name.clone(),
                    scope,
                    decl_start: node.start_byte(),
                    exported,
                });
                let id = self.bindings.len() - 1;
                self.scopes[scope].names.insert(name, id);
                id
            }
        };
        if exported {
            self.bindings[id].exported = true;
        }
        self.sites.insert(node.start_byte(), (id, form));
        Some(id)
    }

    /// Make an existing binding visible under its name in another scope too
    fn link(&mut self, scope: ScopeId, binding: BindingId) {
        let name = self.bindings[binding].name.clone();
        self.scopes[scope].names.entry(name).or_insert(binding);
    }

    fn resolve(&self, mut scope: ScopeId, name: &str) -> Option<BindingId> {
        loop {
            if let Some(&id) = self.scopes[scope].names.get(name) {
                return Some(id);
            }
            scope = self.scopes[scope].parent?;
        }
    }
}

// ============ Pass 1: Declarations ============

struct DeclarationCollector<'i, 's> {
    index: &'i mut ScopeIndex,
    source: &'s [u8],
    stack: Vec<(ScopeId, usize)>,
    scope_of_node: HashMap<usize, ScopeId>,
    function_bodies: HashSet<usize>,
    /// Node id of the declaration wrapped by the current `export` statement
    exported_declaration: Option<usize>,
    /// Scopes whose code runs in strict mode
    strict_scopes: HashSet<ScopeId>,
}

impl<'i, 's> DeclarationCollector<'i, 's> {
    fn new(index: &'i mut ScopeIndex, root: Node, source: &'s [u8]) -> Self {
        let program = index.new_scope(ScopeKind::Program, None);
        let mut scope_of_node = HashMap::new();
        scope_of_node.insert(root.id(), program);
        let mut strict_scopes = HashSet::new();
        if is_module(root) || has_use_strict(root, source) {
            strict_scopes.insert(program);
        }
        Self {
            index,
            source,
            stack: vec![(program, root.id())],
            scope_of_node,
            function_bodies: HashSet::new(),
            exported_declaration: None,
            strict_scopes,
        }
    }

    fn current(&self) -> ScopeId {
        self.stack.last().map_or(0, |(scope, _)| *scope)
    }

    /// Nearest function or program scope, where `var` lands
    fn var_scope(&self) -> ScopeId {
        self.stack
            .iter()
            .rev()
            .map(|(scope, _)| *scope)
            .find(|&scope| {
                matches!(
                    self.index.scopes[scope].kind,
                    ScopeKind::Function | ScopeKind::Program
                )
            })
            .unwrap_or(0)
    }

    fn push_scope(&mut self, node: Node, kind: ScopeKind) -> ScopeId {
        let parent = self.current();
        let scope = self.index.new_scope(kind, Some(parent));
        let strict = self.strict_scopes.contains(&parent)
            || kind == ScopeKind::Class
            || (kind == ScopeKind::Function
                && node
                    .child_by_field_name("body")
                    .map_or(false, |body| has_use_strict(body, self.source)));
        if strict {
            self.strict_scopes.insert(scope);
        }
        self.scope_of_node.insert(node.id(), scope);
        self.stack.push((scope, node.id()));
        scope
    }

    fn declare_pattern(&mut self, scope: ScopeId, pattern: Node, exported: bool) {
        for (node, form) in pattern_bindings(pattern) {
            self.index.declare(scope, node, form, self.source, exported);
        }
    }

    fn is_exported(&self, node: Node) -> bool {
        self.exported_declaration == Some(node.id())
    }

    fn enter_function(&mut self, node: Node) {
        if matches!(node.kind(), "function_declaration" | "generator_function_declaration") {
            if let Some(name) = node.child_by_field_name("name") {
                self.declare_function_name(node, name);
            }
        }
        let scope = self.push_scope(node, ScopeKind::Function);
        if matches!(node.kind(), "function_expression" | "function" | "generator_function") {
            if let Some(name) = node.child_by_field_name("name") {
                self.index.declare(scope, name, OccurrenceForm::Plain, self.source, false);
            }
        }
        if let Some(body) = node.child_by_field_name("body") {
            if body.kind() == "statement_block" {
                self.function_bodies.insert(body.id());
            }
        }
        if let Some(param) = node.child_by_field_name("parameter") {
            self.declare_pattern(scope, param, false);
        }
        if let Some(params) = node.child_by_field_name("parameters") {
            let mut cursor = params.walk();
            let list: Vec<Node> = params.named_children(&mut cursor).collect();
            for param in list {
                self.declare_pattern(scope, param, false);
            }
        }
    }

    /// Sloppy-mode functions declared in a block are also visible from the
    /// enclosing function, so both scopes share one binding
    fn declare_function_name(&mut self, declaration: Node, name: Node) {
        let exported = self.is_exported(declaration);
        let scope = self.current();
        let in_sloppy_block =
            self.index.scopes[scope].kind == ScopeKind::Block && !self.strict_scopes.contains(&scope);
        if !in_sloppy_block {
            self.index.declare(scope, name, OccurrenceForm::Plain, self.source, exported);
            return;
        }
        let target = self.var_scope();
        if let Some(id) = self.index.declare(target, name, OccurrenceForm::Plain, self.source, exported) {
            self.index.link(scope, id);
        }
    }

    fn declare_declarators(&mut self, declaration: Node, scope: ScopeId) {
        let exported = self.is_exported(declaration);
        let mut cursor = declaration.walk();
        let declarators: Vec<Node> = declaration
            .named_children(&mut cursor)
            .filter(|n| n.kind() == "variable_declarator")
            .collect();
        for declarator in declarators {
            if let Some(name) = declarator.child_by_field_name("name") {
                self.declare_pattern(scope, name, exported);
            }
        }
    }

    fn declare_imports(&mut self, import: Node) {
        let program = self.stack.first().map_or(0, |(scope, _)| *scope);
        let mut found = Vec::new();
        crate::deobfuscate::common::visit_nodes(import, |node| match node.kind() {
            "import_clause" | "named_imports" | "import_statement" => true,
            "identifier" => {
                found.push((node, OccurrenceForm::Plain));
                false
            }
            "namespace_import" => {
                let mut cursor = node.walk();
                let ident = node.named_children(&mut cursor).find(|c| c.kind() == "identifier");
                if let Some(ident) = ident {
                    found.push((ident, OccurrenceForm::Plain));
                }
                false
            }
            "import_specifier" => {
                match node.child_by_field_name("alias") {
                    Some(alias) => found.push((alias, OccurrenceForm::Plain)),
                    None => {
                        if let Some(name) = node.child_by_field_name("name").filter(|n| n.kind() == "identifier") {
                            found.push((name, OccurrenceForm::ImportSpecifier));
                        }
                    }
                }
                false
            }
            _ => false,
        });
        for (node, form) in found {
            self.index.declare(program, node, form, self.source, false);
        }
    }
}

impl<'t, 'i, 's> TreeVisitor<'t> for DeclarationCollector<'i, 's> {
    fn enter(&mut self, node: Node<'t>) -> bool {
        let kind = node.kind();
        if is_function_boundary(kind) {
            self.enter_function(node);
            return true;
        }
        match kind {
            "statement_block" => {
                if !self.function_bodies.contains(&node.id()) {
                    self.push_scope(node, ScopeKind::Block);
                }
            }
            "for_statement" | "switch_body" => {
                self.push_scope(node, ScopeKind::Block);
            }
            "for_in_statement" => {
                let scope = self.push_scope(node, ScopeKind::Block);
                if let Some(left) = node.child_by_field_name("left") {
                    match declaration_keyword(node) {
                        Some("var") => {
                            let target = self.var_scope();
                            self.declare_pattern(target, left, false);
                        }
                        Some(_) => self.declare_pattern(scope, left, false),
                        None => {}
                    }
                }
            }
            "catch_clause" => {
                let scope = self.push_scope(node, ScopeKind::Block);
                if let Some(param) = node.child_by_field_name("parameter") {
                    self.declare_pattern(scope, param, false);
                }
            }
            "class" => {
                let scope = self.push_scope(node, ScopeKind::Class);
                if let Some(name) = node.child_by_field_name("name") {
                    self.index.declare(scope, name, OccurrenceForm::Plain, self.source, false);
                }
            }
            "class_declaration" => {
                if let Some(name) = node.child_by_field_name("name") {
                    let exported = self.is_exported(node);
                    self.index.declare(self.current(), name, OccurrenceForm::Plain, self.source, exported);
                }
            }
            "variable_declaration" => {
                let scope = self.var_scope();
                self.declare_declarators(node, scope);
            }
            "lexical_declaration" => {
                let scope = self.current();
                self.declare_declarators(node, scope);
            }
            "import_statement" => {
                self.declare_imports(node);
                return false;
            }
            "export_statement" => {
                self.exported_declaration = node.child_by_field_name("declaration").map(|d| d.id());
            }
            _ => {}
        }
        true
    }

    fn leave(&mut self, node: Node<'t>) {
        if self.stack.len() > 1 && self.stack.last().map(|(_, id)| *id) == Some(node.id()) {
            self.stack.pop();
        }
    }
}

fn is_module(program: Node) -> bool {
    let mut cursor = program.walk();
    let module = program
        .named_children(&mut cursor)
        .any(|child| matches!(child.kind(), "import_statement" | "export_statement"));
    module
}

/// Leading `"use strict"` directive of a program or function body
fn has_use_strict(body: Node, source: &[u8]) -> bool {
    let mut cursor = body.walk();
    let directive = body
        .named_children(&mut cursor)
        .take_while(|child| child.kind() == "expression_statement")
        .filter_map(|statement| statement.named_child(0))
        .take_while(|expr| expr.kind() == "string")
        .any(|expr| matches!(get_node_text(expr, source), "\"use strict\"" | "'use strict'"));
    directive
}

/// `var`, `let` or `const` keyword of a `for (... in/of ...)` header
fn declaration_keyword(for_in: Node) -> Option<&'static str> {
    let mut cursor = for_in.walk();
    let keyword = for_in
        .children(&mut cursor)
        .take_while(|c| c.kind() != "in" && c.kind() != "of")
        .find_map(|c| match c.kind() {
            "var" => Some("var"),
            "let" => Some("let"),
            "const" => Some("const"),
            _ => None,
        });
    keyword
}

/// Binding identifiers introduced by a declaration pattern
pub fn pattern_bindings(pattern: Node) -> Vec<(Node, OccurrenceForm)> {
    let mut out = Vec::new();
    let mut stack = vec![pattern];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "identifier" => out.push((node, OccurrenceForm::Plain)),
            "shorthand_property_identifier_pattern" => out.push((node, OccurrenceForm::ShorthandPattern)),
            "pair_pattern" => stack.extend(node.child_by_field_name("value")),
            "assignment_pattern" | "object_assignment_pattern" => stack.extend(node.child_by_field_name("left")),
            "required_parameter" | "optional_parameter" => stack.extend(node.child_by_field_name("pattern")),
            "object_pattern" | "array_pattern" | "rest_pattern" => {
                let mut cursor = node.walk();
                let children: Vec<Node> = node.named_children(&mut cursor).collect();
                stack.extend(children.into_iter().rev());
            }
            _ => {}
        }
    }
    out
}

// ============ Pass 2: References ============

struct ReferenceResolver<'i, 's, 'm, 't> {
    index: &'i mut ScopeIndex,
    source: &'s [u8],
    scope_of_node: &'m HashMap<usize, ScopeId>,
    stack: Vec<(ScopeId, usize)>,
    ancestors: Vec<Node<'t>>,
}

impl<'i, 's, 'm, 't> ReferenceResolver<'i, 's, 'm, 't> {
    fn current(&self) -> ScopeId {
        self.stack.last().map_or(0, |(scope, _)| *scope)
    }

    fn record_name(&mut self, node: Node) {
        if matches!(
            node.kind(),
            "identifier"
                | "property_identifier"
                | "shorthand_property_identifier"
                | "shorthand_property_identifier_pattern"
                | "statement_identifier"
                | "type_identifier"
                | "private_property_identifier"
        ) {
            let name = get_node_text(node, self.source);
            if !self.index.all_names.contains(name) {
                self.index.all_names.insert(name.to_string());
            }
        }
    }

    fn visit_identifier(&mut self, node: Node, parent: Option<Node>) {
        let start = node.start_byte();
        if let Some(&(binding, form)) = self.index.sites.get(&start) {
            self.index.occurrences.push(Occurrence {
                start,
                end: node.end_byte(),
                binding,
                form,
            });
            return;
        }

        let mut form = match node.kind() {
            "shorthand_property_identifier" => OccurrenceForm::ShorthandProperty,
            "shorthand_property_identifier_pattern" => OccurrenceForm::ShorthandPattern,
            _ => OccurrenceForm::Plain,
        };

        if let Some(parent) = parent {
            match parent.kind() {
                "jsx_opening_element" | "jsx_closing_element" | "jsx_self_closing_element" => {
                    let intrinsic = get_node_text(node, self.source)
                        .chars()
                        .next()
                        .map_or(true, |c| c.is_ascii_lowercase());
                    if intrinsic {
                        return;
                    }
                }
                "import_specifier" => return,
                "export_specifier" => {
                    let alias = parent.child_by_field_name("alias");
                    if alias.map(|a| a.id()) == Some(node.id()) {
                        return;
                    }
                    if alias.is_none() {
                        form = OccurrenceForm::ExportSpecifier;
                    }
                }
                _ => {}
            }
        }

        let name = get_node_text(node, self.source);
        match self.index.resolve(self.current(), name) {
            Some(binding) => self.index.occurrences.push(Occurrence {
                start,
                end: node.end_byte(),
                binding,
                form,
            }),
            None => {
                self.index.unresolved.insert(name.to_string());
            }
        }
    }
}

impl<'i, 's, 'm, 't> TreeVisitor<'t> for ReferenceResolver<'i, 's, 'm, 't> {
    fn enter(&mut self, node: Node<'t>) -> bool {
        if let Some(&scope) = self.scope_of_node.get(&node.id()) {
            self.stack.push((scope, node.id()));
        }
        self.record_name(node);
        if matches!(
            node.kind(),
            "identifier" | "shorthand_property_identifier" | "shorthand_property_identifier_pattern"
        ) {
            let parent = self.ancestors.last().copied();
            self.visit_identifier(node, parent);
        }
        self.ancestors.push(node);
        true
    }

    fn leave(&mut self, node: Node<'t>) {
        self.ancestors.pop();
        if self.stack.last().map(|(_, id)| *id) == Some(node.id()) {
            self.stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deobfuscate::parser::{parse_strict, Dialect, SourceUnit};

    fn analyze(code: &str) -> (SourceUnit, ScopeIndex) {
        let unit = parse_strict(code, Dialect::JavaScript).unwrap();
        let index = ScopeIndex::analyze(unit.root(), unit.source());
        (unit, index)
    }

    fn occurrences_of<'a>(index: &ScopeIndex, unit: &'a SourceUnit, name: &str) -> Vec<(usize, &'a str)> {
        index
            .occurrences()
            .iter()
            .filter(|o| index.bindings()[o.binding].name == name)
            .map(|o| (o.binding, &unit.text()[o.start..o.end]))
            .collect()
    }

    #[test]
    fn test_shadowed_bindings_are_distinct() {
        let (unit, index) = analyze("var a = 1; function f(a) { return a; } a;");
        let occ = occurrences_of(&index, &unit, "a");
        assert_eq!(occ.len(), 4);
        let outer = occ[0].0;
        assert_eq!(occ[3].0, outer);
        assert_ne!(occ[1].0, outer);
        assert_eq!(occ[1].0, occ[2].0);
    }

    #[test]
    fn test_var_hoists_out_of_blocks_but_let_does_not() {
        let (_, index) = analyze("function f() { if (x) { var v = 1; let l = 2; } return v + l; }");
        assert!(index.is_unresolved("l"));
        assert!(!index.is_unresolved("v"));
        let v = index.bindings().iter().find(|b| b.name == "v").unwrap();
        assert_eq!(index.scope_kind(v.scope), Some(ScopeKind::Function));
    }

    #[test]
    fn test_function_declarations_hoist() {
        let (unit, index) = analyze("g(); function g() {}");
        let occ = occurrences_of(&index, &unit, "g");
        assert_eq!(occ.len(), 2);
        assert_eq!(occ[0].0, occ[1].0);
    }

    #[test]
    fn test_block_functions_are_visible_from_enclosing_function() {
        let (unit, index) = analyze("if (x) { function a() { return 1; } }\na();");
        let occ = occurrences_of(&index, &unit, "a");
        assert_eq!(occ.len(), 2);
        assert_eq!(occ[0].0, occ[1].0);
        assert!(!index.is_unresolved("a"));

        let (unit, index) = analyze("function f() { { function b() {} } return b; }");
        let occ = occurrences_of(&index, &unit, "b");
        assert_eq!(occ.len(), 2);
        assert_eq!(occ[0].0, occ[1].0);
    }

    #[test]
    fn test_strict_block_functions_stay_in_block() {
        let (_, index) = analyze("'use strict';\nif (x) { function a() {} }\na();");
        assert!(index.is_unresolved("a"));

        let (_, index) = analyze("function f() { \"use strict\"; { function b() {} } return b; }");
        assert!(index.is_unresolved("b"));

        let (_, index) = analyze("export const z = 1;\nif (x) { function a() {} }\na();");
        assert!(index.is_unresolved("a"));
    }

    #[test]
    fn test_globals_stay_unresolved() {
        let (_, index) = analyze("console.log(window.x, e);");
        assert!(index.is_unresolved("console"));
        assert!(index.is_unresolved("e"));
        assert!(index.bindings().is_empty());
        assert!(index.all_names().contains("log"));
    }

    #[test]
    fn test_destructuring_and_shorthand_forms() {
        let (_, index) = analyze("const {a, b: c, d = 1} = o; const [e, ...f] = g; x({a, c});");
        let names: Vec<_> = index.bindings().iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c", "d", "e", "f"]);
        let forms: Vec<_> = index
            .occurrences()
            .iter()
            .filter(|o| index.bindings()[o.binding].name == "a")
            .map(|o| o.form)
            .collect();
        assert_eq!(forms, vec![OccurrenceForm::ShorthandPattern, OccurrenceForm::ShorthandProperty]);
    }

    #[test]
    fn test_catch_and_for_scopes() {
        let (_, index) = analyze("try {} catch (e) { e; } for (let i = 0; i < 2; i++) {} for (const k in o) { k; } i;");
        assert!(index.is_unresolved("i"));
        assert!(!index.is_unresolved("e"));
        assert!(!index.is_unresolved("k"));
    }

    #[test]
    fn test_imports_and_exports() {
        let code = "import d, {a, b as c} from 'm'; import * as ns from 'n'; export {a}; export const z = c;";
        let unit = parse_strict(code, Dialect::JavaScript).unwrap();
        let index = ScopeIndex::analyze(unit.root(), unit.source());
        let names: Vec<_> = index.bindings().iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["d", "a", "c", "ns", "z"]);
        assert!(index.bindings().iter().find(|b| b.name == "z").unwrap().exported);
        let a_forms: Vec<_> = index
            .occurrences()
            .iter()
            .filter(|o| index.bindings()[o.binding].name == "a")
            .map(|o| o.form)
            .collect();
        assert_eq!(a_forms, vec![OccurrenceForm::ImportSpecifier, OccurrenceForm::ExportSpecifier]);
    }

    #[test]
    fn test_jsx_intrinsic_tags_are_not_references() {
        let unit = parse_strict("const A = 1; <div><A /></div>;", Dialect::JavaScript).unwrap();
        let index = ScopeIndex::analyze(unit.root(), unit.source());
        assert!(!index.is_unresolved("div"));
        let a = index.occurrences().iter().filter(|o| index.bindings()[o.binding].name == "A").count();
        assert_eq!(a, 2);
    }
}
