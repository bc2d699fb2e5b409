//! Tokenizer for the statement language

use super::ExecError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i128),
    Float(f64),
    Str(String),
    Name(String),
    /// `+ - * / // % ** == != < <= > >= = += -= *= ( ) [ ] { } , : . ;`
    Op(&'static str),
    Newline,
    Eof,
}

const OPERATORS: [&str; 27] = [
    "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "+", "-", "*", "/", "%", "<", ">", "=",
    "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

pub fn tokenize(src: &str) -> Result<Vec<Token>, ExecError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if c == '\n' {
            // Newlines inside brackets are insignificant
            if depth == 0 && !matches!(tokens.last(), Some(Token::Newline) | None) {
                tokens.push(Token::Newline);
            }
            i += 1;
            continue;
        }

        if c == '\\' && chars.get(i + 1) == Some(&'\n') {
            i += 2;
            continue;
        }

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            let mut is_float = false;
            while i < chars.len() {
                let d = chars[i];
                if d.is_ascii_digit() || d == '_' {
                    i += 1;
                } else if d == '.' && !is_float {
                    is_float = true;
                    i += 1;
                } else if (d == 'e' || d == 'E')
                    && chars
                        .get(i + 1)
                        .is_some_and(|n| n.is_ascii_digit() || *n == '-' || *n == '+')
                {
                    is_float = true;
                    i += 2;
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let token = if is_float {
                Token::Float(
                    text.parse()
                        .map_err(|_| ExecError::Syntax(format!("invalid number '{}'", text)))?,
                )
            } else {
                Token::Int(
                    text.parse()
                        .map_err(|_| ExecError::Syntax(format!("integer literal too large '{}'", text)))?,
                )
            };
            tokens.push(token);
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Name(chars[start..i].iter().collect()));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(ExecError::Syntax("unterminated string literal".into()));
                };
                i += 1;
                match ch {
                    '\\' => {
                        let esc = chars.get(i).copied().unwrap_or('\\');
                        i += 1;
                        s.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                    '\n' => return Err(ExecError::Syntax("unterminated string literal".into())),
                    ch if ch == quote => break,
                    ch => s.push(ch),
                }
            }
            tokens.push(Token::Str(s));
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
            return Err(ExecError::Syntax(format!("invalid character '{}'", c)));
        };
        match *op {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += op.chars().count();
        tokens.push(Token::Op(op));
    }

    if depth > 0 {
        return Err(ExecError::Syntax("unexpected EOF, unclosed bracket".into()));
    }
    if !matches!(tokens.last(), Some(Token::Newline) | None) {
        tokens.push(Token::Newline);
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens() {
        let toks = tokenize("x = nt.divisors(360) ** 2 // 3  # note").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Name("x".into()),
                Token::Op("="),
                Token::Name("nt".into()),
                Token::Op("."),
                Token::Name("divisors".into()),
                Token::Op("("),
                Token::Int(360),
                Token::Op(")"),
                Token::Op("**"),
                Token::Int(2),
                Token::Op("//"),
                Token::Int(3),
                Token::Newline,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_inside_brackets_are_ignored() {
        let toks = tokenize("[1,\n 2]\n\n'a'").unwrap();
        let newlines = toks.iter().filter(|t| **t == Token::Newline).count();
        assert_eq!(newlines, 2);
    }

    #[test]
    fn test_literals() {
        assert_eq!(tokenize("1_000").unwrap()[0], Token::Int(1000));
        assert_eq!(tokenize("2.5e3").unwrap()[0], Token::Float(2500.0));
        assert_eq!(tokenize(r#""a\"b""#).unwrap()[0], Token::Str("a\"b".into()));
        assert!(tokenize("'open").is_err());
        assert!(tokenize("f(1").is_err());
        assert!(tokenize("$").is_err());
    }
}
