//! Syntactic validation of proposed Python source via tree-sitter.

use tree_sitter::{Node, Parser};

use crate::error::PatchError;

/// Check that `source` parses as Python without error or missing nodes,
/// then reject what the grammar tolerates but CPython refuses to compile:
/// Python 2 `print`/`exec` statements, `return` and `yield` outside a
/// function, and `break`/`continue` outside a loop.
/// Blank source is rejected; a rewrite never legitimately empties a module.
pub fn validate_python(source: &str) -> Result<(), PatchError> {
    if source.trim().is_empty() {
        return Err(PatchError::InvalidSyntax {
            line: 1,
            column: 1,
            message: "source is empty".into(),
        });
    }

    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| PatchError::InvalidSyntax {
            line: 0,
            column: 0,
            message: format!("cannot load Python grammar: {e}"),
        })?;
    let tree = parser.parse(source, None).ok_or_else(|| PatchError::InvalidSyntax {
        line: 0,
        column: 0,
        message: "parser returned no tree".into(),
    })?;

    let root = tree.root_node();
    if !root.has_error() {
        return match misplaced(root, source, Scope::default()) {
            Some((node, message)) => {
                let pos = node.start_position();
                Err(PatchError::InvalidSyntax {
                    line: pos.row + 1,
                    column: pos.column + 1,
                    message: message.to_string(),
                })
            }
            None => Ok(()),
        };
    }

    let (line, column, message) = match first_error(root) {
        Some(node) => {
            let pos = node.start_position();
            let message = if node.is_missing() {
                format!("missing `{}`", node.kind())
            } else {
                let snippet: String = source
                    .get(node.byte_range())
                    .unwrap_or_default()
                    .chars()
                    .take(40)
                    .collect();
                format!("unexpected `{}`", snippet.trim())
            };
            (pos.row + 1, pos.column + 1, message)
        }
        None => (1, 1, "syntax error".to_string()),
    };
    Err(PatchError::InvalidSyntax {
        line,
        column,
        message,
    })
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    node.children(&mut cursor).find_map(first_error)
}

#[derive(Debug, Clone, Copy, Default)]
struct Scope {
    function: bool,
    looping: bool,
}

/// First statement the grammar accepts in a position CPython rejects.
fn misplaced<'t>(
    node: Node<'t>,
    source: &str,
    scope: Scope,
) -> Option<(Node<'t>, &'static str)> {
    match node.kind() {
        "print_statement" if !is_call_form(node, source, "print") => {
            return Some((node, "Python 2 print statement"));
        }
        "exec_statement" if !is_call_form(node, source, "exec") => {
            return Some((node, "Python 2 exec statement"));
        }
        "return_statement" if !scope.function => {
            return Some((node, "'return' outside function"));
        }
        "yield" if node.is_named() && !scope.function => {
            return Some((node, "'yield' outside function"));
        }
        "break_statement" if !scope.looping => return Some((node, "'break' outside loop")),
        "continue_statement" if !scope.looping => {
            return Some((node, "'continue' not properly in loop"));
        }
        _ => {}
    }

    let inner = match node.kind() {
        "function_definition" | "lambda" => Scope {
            function: true,
            looping: false,
        },
        "class_definition" => Scope::default(),
        _ => scope,
    };
    let is_loop = matches!(node.kind(), "for_statement" | "while_statement");

    let mut cursor = node.walk();
    if !cursor.goto_first_child() {
        return None;
    }
    loop {
        let child_scope = if is_loop && cursor.field_name() == Some("body") {
            Scope {
                looping: true,
                ..inner
            }
        } else {
            inner
        };
        if let Some(found) = misplaced(cursor.node(), source, child_scope) {
            return Some(found);
        }
        if !cursor.goto_next_sibling() {
            return None;
        }
    }
}

/// `print (x)` is an ordinary call in Python 3 even where the grammar
/// reads it as a statement.
fn is_call_form(node: Node<'_>, source: &str, keyword: &str) -> bool {
    source
        .get(node.byte_range())
        .and_then(|text| text.strip_prefix(keyword))
        .is_some_and(|rest| rest.trim_start().starts_with('('))
}
