//! Shell-like tokenizer for the expression language.
//!
//! Words may contain `.!=<>:{}-` in addition to alphanumerics, so dotted
//! paths, comparison operators and `{param:spec}` references each come out
//! as a single token. Quoted strings keep their quotes; the parser strips
//! them.

use crate::{Error, Result};

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || ".!=<>:{}-".contains(c)
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '(' || c == ')' {
            chars.next();
            tokens.push(c.to_string());
        } else if c == '"' || c == '\'' {
            chars.next();
            let quote = c;
            let mut tok = String::new();
            tok.push(quote);
            let mut closed = false;
            for q in chars.by_ref() {
                tok.push(q);
                if q == quote {
                    closed = true;
                    break;
                }
            }
            if !closed {
                return Err(Error::expr(format!("No closing quotation in \"{input}\"")));
            }
            tokens.push(tok);
        } else if is_word_char(c) {
            let mut tok = String::new();
            while let Some(&w) = chars.peek() {
                if is_word_char(w) {
                    tok.push(w);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(tok);
        } else {
            // Operators like + * / stand alone.
            chars.next();
            tokens.push(c.to_string());
        }
    }
    Ok(tokens)
}
