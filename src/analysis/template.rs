//! Prompt templates: `{{var}}`, dotted `{{a.b}}` lookups, and nestable
//! `{{#if var}} ... {{else}} ... {{/if}}` blocks evaluated against a JSON
//! context.

use serde_json::Value;

use crate::error::KbError;

#[derive(Debug, PartialEq)]
enum Node {
    Text(String),
    Var(String),
    If {
        cond: String,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

struct Frame {
    cond: String,
    then: Vec<Node>,
    otherwise: Vec<Node>,
    in_else: bool,
}

/// Render `template` against `ctx` (normally a JSON object).
pub fn render(template: &str, ctx: &Value) -> Result<String, KbError> {
    let nodes = parse(template)?;
    let mut out = String::with_capacity(template.len());
    render_nodes(&nodes, ctx, &mut out);
    Ok(out)
}

/// Names referenced by `{{var}}` or `{{#if var}}`, in order of first use.
pub fn variables(template: &str) -> Result<Vec<String>, KbError> {
    fn walk(nodes: &[Node], out: &mut Vec<String>) {
        for node in nodes {
            match node {
                Node::Text(_) => {}
                Node::Var(name) => push_unique(out, name),
                Node::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    push_unique(out, cond);
                    walk(then, out);
                    walk(otherwise, out);
                }
            }
        }
    }
    fn push_unique(out: &mut Vec<String>, name: &str) {
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }

    let nodes = parse(template)?;
    let mut out = Vec::new();
    walk(&nodes, &mut out);
    Ok(out)
}

fn parse(template: &str) -> Result<Vec<Node>, KbError> {
    let mut root: Vec<Node> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut rest = template;

    fn target<'a>(root: &'a mut Vec<Node>, stack: &'a mut [Frame]) -> &'a mut Vec<Node> {
        match stack.last_mut() {
            Some(f) if f.in_else => &mut f.otherwise,
            Some(f) => &mut f.then,
            None => root,
        }
    }

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            target(&mut root, &mut stack).push(Node::Text(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| KbError::Template("unclosed '{{' tag".to_string()))?;
        let tag = after[..close].trim();
        rest = &after[close + 2..];

        if let Some(cond) = tag.strip_prefix("#if") {
            let cond = cond.trim();
            if cond.is_empty() {
                return Err(KbError::Template("{{#if}} without a condition".to_string()));
            }
            stack.push(Frame {
                cond: cond.to_string(),
                then: Vec::new(),
                otherwise: Vec::new(),
                in_else: false,
            });
        } else if tag == "else" {
            match stack.last_mut() {
                Some(f) if !f.in_else => f.in_else = true,
                Some(_) => return Err(KbError::Template("duplicate {{else}}".to_string())),
                None => return Err(KbError::Template("{{else}} outside {{#if}}".to_string())),
            }
        } else if tag == "/if" {
            let f = stack
                .pop()
                .ok_or_else(|| KbError::Template("{{/if}} without {{#if}}".to_string()))?;
            target(&mut root, &mut stack).push(Node::If {
                cond: f.cond,
                then: f.then,
                otherwise: f.otherwise,
            });
        } else if tag.is_empty() {
            return Err(KbError::Template("empty '{{}}' tag".to_string()));
        } else {
            target(&mut root, &mut stack).push(Node::Var(tag.to_string()));
        }
    }

    if !rest.is_empty() {
        target(&mut root, &mut stack).push(Node::Text(rest.to_string()));
    }

    if let Some(f) = stack.last() {
        return Err(KbError::Template(format!("unclosed {{{{#if {}}}}}", f.cond)));
    }

    Ok(root)
}

fn render_nodes(nodes: &[Node], ctx: &Value, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Var(name) => {
                if let Some(v) = lookup(ctx, name) {
                    out.push_str(&value_text(v));
                }
            }
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if lookup(ctx, cond).is_some_and(truthy) {
                    then
                } else {
                    otherwise
                };
                render_nodes(branch, ctx, out);
            }
        }
    }
}

/// Resolve `a.b.0.c` through objects and arrays.
fn lookup<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(ctx, |cur, key| match cur {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => v.to_string(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string_pretty(v).unwrap_or_default(),
    }
}
