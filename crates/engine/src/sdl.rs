//! Minimal GraphQL SDL scanner. Extracts object types and their field names;
//! everything else (inputs, enums, directives, descriptions) is skipped.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Name(String),
    Punct(char),
    /// String or number literal; content is irrelevant here.
    Lit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDoc {
    /// Object type name -> field names. `extend type` merges into the base.
    pub types: BTreeMap<String, BTreeSet<String>>,
}

impl SchemaDoc {
    pub fn has_type(&self, ty: &str) -> bool { self.types.contains_key(ty) }

    pub fn has_field(&self, ty: &str, field: &str) -> bool {
        self.types.get(ty).map(|f| f.contains(field)).unwrap_or(false)
    }
}

fn tokenize(src: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0usize;
    while let Some(&c) = chars.get(i) {
        if c.is_whitespace() || c == ',' {
            i += 1;
            continue;
        }
        if c == '#' {
            while chars.get(i).is_some_and(|c| *c != '\n') {
                i += 1;
            }
            continue;
        }
        if c == '"' {
            let block = chars.get(i + 1) == Some(&'"') && chars.get(i + 2) == Some(&'"');
            if block {
                i += 3;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated block string".into()),
                        Some('"') if chars.get(i + 1) == Some(&'"') && chars.get(i + 2) == Some(&'"') => {
                            i += 3;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
            } else {
                i += 1;
                loop {
                    match chars.get(i) {
                        None | Some('\n') => return Err("unterminated string".into()),
                        Some('\\') => i += 2,
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            out.push(Tok::Lit);
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while chars.get(i).is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_') {
                i += 1;
            }
            out.push(Tok::Name(chars[start..i].iter().collect()));
            continue;
        }
        if c.is_ascii_digit() || c == '-' {
            while chars.get(i).is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E')) {
                i += 1;
            }
            out.push(Tok::Lit);
            continue;
        }
        if "{}()[]:=@!|&$".contains(c) {
            out.push(Tok::Punct(c));
            i += 1;
            continue;
        }
        return Err(format!("unexpected character {:?}", c));
    }
    Ok(out)
}

/// Index just past the token closing the group opened at `start`.
fn skip_balanced(toks: &[Tok], start: usize, open: char, close: char) -> Result<usize, String> {
    let mut depth = 0usize;
    for (j, t) in toks.iter().enumerate().skip(start) {
        match t {
            Tok::Punct(c) if *c == open => depth += 1,
            Tok::Punct(c) if *c == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(j + 1);
                }
            }
            _ => {}
        }
    }
    Err(format!("unbalanced '{}'", open))
}

fn scan_fields(toks: &[Tok], open: usize, ty: &str) -> Result<(BTreeSet<String>, usize), String> {
    let mut fields = BTreeSet::new();
    let mut j = open + 1;
    loop {
        match toks.get(j) {
            None => return Err(format!("unterminated body of type {}", ty)),
            Some(Tok::Punct('}')) => return Ok((fields, j + 1)),
            Some(Tok::Punct('(')) => j = skip_balanced(toks, j, '(', ')')?,
            Some(Tok::Punct('{')) => return Err(format!("unexpected '{{' in body of type {}", ty)),
            // Directive: skip its name, arguments go through the '(' arm.
            Some(Tok::Punct('@')) => j += 2,
            Some(Tok::Name(n)) => {
                if matches!(toks.get(j + 1), Some(Tok::Punct(':')) | Some(Tok::Punct('('))) {
                    fields.insert(n.clone());
                }
                j += 1;
            }
            Some(_) => j += 1,
        }
    }
}

/// Scan an SDL document for object types.
pub fn scan(sdl: &str) -> Result<SchemaDoc, String> {
    let toks = tokenize(sdl)?;
    let mut doc = SchemaDoc::default();
    let mut i = 0usize;
    while let Some(t) = toks.get(i) {
        let after_at = i > 0 && toks.get(i - 1) == Some(&Tok::Punct('@'));
        match t {
            Tok::Name(kw) if kw == "type" && !after_at => {
                let name = match toks.get(i + 1) {
                    Some(Tok::Name(n)) => n.clone(),
                    _ => return Err("type definition without a name".into()),
                };
                // Header: `implements A & B`, directives; stop at the field block.
                let mut j = i + 2;
                loop {
                    match toks.get(j) {
                        Some(Tok::Punct('{')) => break,
                        Some(Tok::Punct('(')) => j = skip_balanced(&toks, j, '(', ')')?,
                        Some(Tok::Name(k)) if k == "type" => return Err(format!("type {} has no field block", name)),
                        None => return Err(format!("type {} has no field block", name)),
                        Some(_) => j += 1,
                    }
                }
                let (fields, end) = scan_fields(&toks, j, &name)?;
                if fields.is_empty() {
                    return Err(format!("type {} defines no fields", name));
                }
                doc.types.entry(name).or_default().extend(fields);
                i = end;
            }
            Tok::Punct('{') => i = skip_balanced(&toks, i, '{', '}')?,
            Tok::Punct('(') => i = skip_balanced(&toks, i, '(', ')')?,
            Tok::Punct(c @ ('}' | ')')) => return Err(format!("unbalanced '{}'", c)),
            _ => i += 1,
        }
    }
    if doc.types.is_empty() {
        return Err("schema defines no object types".into());
    }
    Ok(doc)
}
