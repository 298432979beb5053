//! Symbol outlines via tree-sitter, feeding the `Cmap`/`CmapFull` feature
//! levels and symbol-aligned interval splitting.
//!
//! Extraction is locked to Rust and Python grammars; files in other
//! languages have no extractor and degrade to file-name level upstream.

use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tree_sitter::{Language, Node, Parser};

/// Normalized symbol kinds across languages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    /// Free-standing function
    Function,

    /// Class/impl/trait method
    Method,

    /// Rust struct
    Struct,

    /// Rust enum
    Enum,

    /// Rust trait
    Trait,

    /// Python class
    Class,

    /// Rust impl block
    Impl,

    /// Type alias / typedef
    TypeAlias,

    /// Module / namespace
    Module,

    /// Constant definition
    Constant,

    /// Static or module-level variable
    Variable,
}

impl SymbolKind {
    pub fn label(self) -> &'static str {
        match self {
            SymbolKind::Function => "fn",
            SymbolKind::Method => "method",
            SymbolKind::Struct => "struct",
            SymbolKind::Enum => "enum",
            SymbolKind::Trait => "trait",
            SymbolKind::Class => "class",
            SymbolKind::Impl => "impl",
            SymbolKind::TypeAlias => "type",
            SymbolKind::Module => "mod",
            SymbolKind::Constant => "const",
            SymbolKind::Variable => "static",
        }
    }
}

/// One outline entry: a named symbol with its line span and the first
/// source line as a signature preview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutlineSymbol {
    pub kind: SymbolKind,
    pub name: String,

    /// Enclosing scope (impl type, trait, or class), if any
    pub scope: Option<String>,

    /// 1-based inclusive line span
    pub start_line: usize,
    pub end_line: usize,

    /// First line of the declaration, trimmed
    pub signature: String,
}

/// Common extractor interface; one implementation per supported language.
pub trait SymbolExtractor {
    fn language(&self) -> &'static str;

    fn extract(&self, content: &str) -> Result<Vec<OutlineSymbol>>;
}

/// Resolve an extractor from a file extension, or None for unsupported
/// languages (callers degrade the feature level).
pub fn extractor_for(path: &Path) -> Option<Box<dyn SymbolExtractor>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("rs") => Some(Box::new(RustOutline::new())),
        Some("py") => Some(Box::new(PythonOutline::new())),
        _ => None,
    }
}

pub fn supports(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("rs") | Some("py")
    )
}

/// Render outline lines for the Cmap levels. `full` includes signature
/// text; otherwise just kind, name, and line.
pub fn outline_lines(symbols: &[OutlineSymbol], full: bool) -> Vec<String> {
    symbols
        .iter()
        .map(|s| {
            let scoped = match &s.scope {
                Some(scope) => format!("{scope}.{}", s.name),
                None => s.name.clone(),
            };
            if full {
                format!("{} {} (line {}): {}", s.kind.label(), scoped, s.start_line, s.signature)
            } else {
                format!("{} {} (line {})", s.kind.label(), scoped, s.start_line)
            }
        })
        .collect()
}

fn parse_tree(language: &Language, content: &str) -> Result<tree_sitter::Tree> {
    let mut parser = Parser::new();
    parser.set_language(language)?;
    parser
        .parse(content, None)
        .ok_or_else(|| anyhow!("tree-sitter failed to parse source"))
}

fn node_name(node: Node, bytes: &[u8]) -> Option<String> {
    if let Some(n) = node.child_by_field_name("name") {
        return n.utf8_text(bytes).ok().map(|s| s.to_string());
    }
    // Fallback for declaration shapes without a name field
    for i in 0..node.named_child_count() {
        let c = node.named_child(i)?;
        if matches!(c.kind(), "identifier" | "type_identifier") {
            return c.utf8_text(bytes).ok().map(|s| s.to_string());
        }
    }
    None
}

fn first_line(node: Node, content: &str) -> String {
    let text = node.utf8_text(content.as_bytes()).unwrap_or_default();
    text.lines().next().unwrap_or_default().trim().to_string()
}

fn symbol_from(
    kind: SymbolKind,
    node: Node,
    content: &str,
    name: String,
    scope: Option<String>,
) -> OutlineSymbol {
    OutlineSymbol {
        kind,
        name,
        scope,
        start_line: node.start_position().row + 1,
        end_line: node.end_position().row + 1,
        signature: first_line(node, content),
    }
}

/// Rust extractor: top-level items plus methods one level inside
/// impl/trait bodies.
pub struct RustOutline {
    language: Language,
}

impl RustOutline {
    pub fn new() -> Self {
        Self {
            language: tree_sitter_rust::LANGUAGE.into(),
        }
    }

    fn visit(&self, node: Node, content: &str, scope: Option<&str>, out: &mut Vec<OutlineSymbol>) {
        let bytes = content.as_bytes();
        for i in 0..node.named_child_count() {
            let Some(child) = node.named_child(i) else {
                continue;
            };
            let kind = match child.kind() {
                "function_item" => Some(if scope.is_some() {
                    SymbolKind::Method
                } else {
                    SymbolKind::Function
                }),
                "struct_item" => Some(SymbolKind::Struct),
                "enum_item" => Some(SymbolKind::Enum),
                "trait_item" => Some(SymbolKind::Trait),
                "type_item" => Some(SymbolKind::TypeAlias),
                "const_item" => Some(SymbolKind::Constant),
                "static_item" => Some(SymbolKind::Variable),
                "mod_item" => Some(SymbolKind::Module),
                "impl_item" => Some(SymbolKind::Impl),
                _ => None,
            };

            let Some(kind) = kind else { continue };
            let name = match kind {
                // An impl block is named after its type
                SymbolKind::Impl => child
                    .child_by_field_name("type")
                    .and_then(|t| t.utf8_text(bytes).ok())
                    .map(|s| s.to_string()),
                _ => node_name(child, bytes),
            };
            let Some(name) = name else { continue };

            out.push(symbol_from(
                kind,
                child,
                content,
                name.clone(),
                scope.map(|s| s.to_string()),
            ));

            // Descend one level into impl/trait/mod bodies for members
            if matches!(kind, SymbolKind::Impl | SymbolKind::Trait) {
                for j in 0..child.named_child_count() {
                    if let Some(body) = child.named_child(j) {
                        if body.kind() == "declaration_list" {
                            self.visit(body, content, Some(&name), out);
                        }
                    }
                }
            } else if kind == SymbolKind::Module {
                for j in 0..child.named_child_count() {
                    if let Some(body) = child.named_child(j) {
                        if body.kind() == "declaration_list" {
                            self.visit(body, content, scope, out);
                        }
                    }
                }
            }
        }
    }
}

impl SymbolExtractor for RustOutline {
    fn language(&self) -> &'static str {
        "rust"
    }

    fn extract(&self, content: &str) -> Result<Vec<OutlineSymbol>> {
        let tree = parse_tree(&self.language, content)?;
        let mut out = Vec::new();
        self.visit(tree.root_node(), content, None, &mut out);
        out.sort_by_key(|s| (s.start_line, s.end_line));
        Ok(out)
    }
}

/// Python extractor: module-level functions and classes, plus methods one
/// level inside class bodies.
pub struct PythonOutline {
    language: Language,
}

impl PythonOutline {
    pub fn new() -> Self {
        Self {
            language: tree_sitter_python::LANGUAGE.into(),
        }
    }

    fn visit(&self, node: Node, content: &str, scope: Option<&str>, out: &mut Vec<OutlineSymbol>) {
        let bytes = content.as_bytes();
        for i in 0..node.named_child_count() {
            let Some(mut child) = node.named_child(i) else {
                continue;
            };

            // Unwrap decorators so the span covers the decorated item
            let span_node = child;
            if child.kind() == "decorated_definition" {
                if let Some(inner) = child.child_by_field_name("definition") {
                    child = inner;
                }
            }

            match child.kind() {
                "function_definition" => {
                    let kind = if scope.is_some() {
                        SymbolKind::Method
                    } else {
                        SymbolKind::Function
                    };
                    if let Some(name) = node_name(child, bytes) {
                        out.push(symbol_from(
                            kind,
                            span_node,
                            content,
                            name,
                            scope.map(|s| s.to_string()),
                        ));
                    }
                }
                "class_definition" => {
                    if let Some(name) = node_name(child, bytes) {
                        out.push(symbol_from(
                            SymbolKind::Class,
                            span_node,
                            content,
                            name.clone(),
                            scope.map(|s| s.to_string()),
                        ));
                        if let Some(body) = child.child_by_field_name("body") {
                            self.visit(body, content, Some(&name), out);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl SymbolExtractor for PythonOutline {
    fn language(&self) -> &'static str {
        "python"
    }

    fn extract(&self, content: &str) -> Result<Vec<OutlineSymbol>> {
        let tree = parse_tree(&self.language, content)?;
        let mut out = Vec::new();
        self.visit(tree.root_node(), content, None, &mut out);
        out.sort_by_key(|s| (s.start_line, s.end_line));
        Ok(out)
    }
}
