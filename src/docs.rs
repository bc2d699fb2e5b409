//! API documentation catalog and relevance ranking
//!
//! The planner prompt carries the allowed library names and a handful of
//! documentation snippets ranked against the user's question.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// One documented library function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiDoc {
    pub name: String,
    pub signature: String,
    pub summary: String,
}

/// Parsed documentation plus the allowed-name catalog
#[derive(Debug, Clone, Default)]
pub struct DocCatalog {
    pub docs: Vec<ApiDoc>,
    pub names: Vec<String>,
}

/// Names always allowed even without a `###` section
const CORE_TYPES: [&str; 6] = ["Number", "Vector", "Matrix", "Monomial", "Polynomial", "clear_cache"];

/// Used when nothing in the question matches any entry
const COMMONLY_USEFUL: [&str; 6] = ["is_prime", "primes", "prime_factors", "divisors", "totient", "crt"];

pub const DEFAULT_SNIPPET_LIMIT: usize = 8;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z_]{3,}").expect("static regex"));
static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^>\s*(.+)").expect("static regex"));
static CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_]\w*)\s*\(").expect("static regex"));

/// Parse an API.md: `### name`, a fenced python signature, a `>` summary
pub fn parse_api_md(content: &str) -> DocCatalog {
    let mut docs = Vec::new();
    let mut names: Vec<String> = Vec::new();

    // Sections start at line-leading "### "
    let mut sections = Vec::new();
    let mut current: Option<String> = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("### ") {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(format!("{}\n", rest));
        } else if let Some(section) = current.as_mut() {
            section.push_str(line);
            section.push('\n');
        }
    }
    if let Some(section) = current {
        sections.push(section);
    }

    for section in sections {
        let name = section.lines().next().unwrap_or("").trim().to_string();
        if name.is_empty() || name.contains(' ') {
            continue;
        }
        if !names.contains(&name) {
            names.push(name.clone());
        }

        let signature = section
            .find("```python")
            .and_then(|start| {
                let after = &section[start + "```python".len()..];
                after.find("```").map(|end| after[..end].trim().to_string())
            })
            .unwrap_or_default();

        let summary = SUMMARY_RE
            .captures(&section)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        if !signature.is_empty() {
            docs.push(ApiDoc {
                name,
                signature,
                summary,
            });
        }
    }

    for t in CORE_TYPES {
        if !names.iter().any(|n| n == t) {
            names.push(t.to_string());
        }
    }

    DocCatalog { docs, names }
}

/// Catalog describing the built-in interpreter library
pub fn builtin() -> DocCatalog {
    let entries: [(&str, &str, &str); 16] = [
        ("is_prime", "is_prime(n: int) -> bool", "Deterministic primality test."),
        ("primes", "primes(low: int, high: int | None = None) -> list[int]", "Primes in [low, high], or up to low when high is omitted."),
        ("prime_factors", "prime_factors(n: int) -> list[int]", "Prime factors of n with multiplicity, ascending."),
        ("factor", "factor(n: int) -> dict[int, int]", "Prime factorization as a prime -> exponent mapping."),
        ("divisors", "divisors(n: int) -> list[int]", "All positive divisors of n in ascending order."),
        ("totient", "totient(n: int) -> int", "Euler's totient function phi(n)."),
        ("gcd", "gcd(*values: int) -> int", "Greatest common divisor."),
        ("lcm", "lcm(*values: int) -> int", "Least common multiple."),
        ("egcd", "egcd(a: int, b: int) -> tuple[int, int, int]", "Extended Euclid: (g, x, y) with a*x + b*y = g."),
        ("crt", "crt(residues: list[int], moduli: list[int]) -> int | None", "Chinese remainder theorem solution, or None when inconsistent."),
        ("discrete_log", "discrete_log(target: int, base: int, modulus: int) -> int | None", "Smallest x with base**x = target (mod modulus)."),
        ("fibonacci", "fibonacci(n: int) -> int", "The n-th Fibonacci number, fibonacci(0) = 0."),
        ("mod_inverse", "mod_inverse(a: int, m: int) -> int", "Inverse of a modulo m."),
        ("pow", "pow(base: int, exp: int, mod: int | None = None) -> int", "Power, optionally modular."),
        ("isqrt", "isqrt(n: int) -> int", "Integer square root, floor(sqrt(n))."),
        ("next_prime", "next_prime(n: int) -> int", "Smallest prime strictly greater than n."),
    ];

    let docs: Vec<ApiDoc> = entries
        .iter()
        .map(|(name, signature, summary)| ApiDoc {
            name: name.to_string(),
            signature: signature.to_string(),
            summary: summary.to_string(),
        })
        .collect();
    let names = docs.iter().map(|d| d.name.clone()).collect();
    DocCatalog { docs, names }
}

/// Load docs from a path or URL, falling back to the built-in catalog
pub async fn load(source: Option<&str>, client: &reqwest::Client) -> DocCatalog {
    let Some(source) = source else {
        return builtin();
    };

    let content = if source.starts_with("http://") || source.starts_with("https://") {
        match fetch(client, source).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(%source, error = %e, "failed to fetch API docs, using built-in catalog");
                return builtin();
            }
        }
    } else {
        match tokio::fs::read_to_string(Path::new(source)).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(%source, error = %e, "failed to read API docs, using built-in catalog");
                return builtin();
            }
        }
    };

    let catalog = parse_api_md(&content);
    tracing::info!(docs = catalog.docs.len(), names = catalog.names.len(), "loaded API docs");
    if catalog.docs.is_empty() {
        tracing::warn!(%source, "API docs contained no entries, using built-in catalog");
        return builtin();
    }
    catalog
}

async fn fetch(client: &reqwest::Client, url: &str) -> crate::Result<String> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(crate::Error::Http {
            status: response.status().as_u16(),
            message: format!("HTTP {}", response.status()),
        });
    }
    Ok(response.text().await?)
}

/// Lowercased runs of letters/underscores, three or more long
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Relevance of one entry; a hit on the name counts extra
pub fn score(doc: &ApiDoc, tokens: &[String]) -> usize {
    let haystack = format!("{} {} {}", doc.name, doc.signature, doc.summary).to_lowercase();
    let name = doc.name.to_lowercase();
    tokens
        .iter()
        .map(|t| {
            let mut s = 0;
            if haystack.contains(t.as_str()) {
                s += 1;
            }
            if name.contains(t.as_str()) {
                s += 2;
            }
            s
        })
        .sum()
}

impl DocCatalog {
    /// Top entries for a question; ties keep catalog order
    pub fn rank(&self, question: &str, limit: usize) -> Vec<&ApiDoc> {
        let tokens = tokenize(question);
        let mut scored: Vec<(&ApiDoc, usize)> = self
            .docs
            .iter()
            .map(|d| (d, score(d, &tokens)))
            .filter(|(_, s)| *s > 0)
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));

        let picked: Vec<&ApiDoc> = scored.into_iter().take(limit).map(|(d, _)| d).collect();
        if !picked.is_empty() {
            return picked;
        }

        self.docs
            .iter()
            .filter(|d| COMMONLY_USEFUL.contains(&d.name.as_str()))
            .take(limit)
            .collect()
    }

    /// Snippet list for the planner prompt
    pub fn snippets(&self, question: &str, limit: usize) -> String {
        if self.docs.is_empty() {
            return "- (API docs not loaded)".to_string();
        }

        self.rank(question, limit)
            .into_iter()
            .map(|doc| {
                let signature = if doc.signature.is_empty() {
                    doc.name.as_str()
                } else {
                    doc.signature.as_str()
                };
                let display = CALL_RE.replace(signature, "nt.$1(");
                if doc.summary.is_empty() {
                    format!("- {}", display)
                } else {
                    format!("- {} — {}", display, doc.summary)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const API_MD: &str = r#"# NumThy API

## Primes

### is_prime
```python
is_prime(n: int) -> bool
```
> Test whether n is prime.

### next_prime
```python
next_prime(n: int) -> int
```
> Smallest prime greater than n.

### Some Heading
Not a function.

### divisors
```python
divisors(n: int) -> list[int]
```
> Divisors of n.

### totient
No signature here.
"#;

    #[test]
    fn test_parse_api_md() {
        let cat = parse_api_md(API_MD);
        let names: Vec<_> = cat.docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["is_prime", "next_prime", "divisors"]);
        assert_eq!(cat.docs[0].summary, "Test whether n is prime.");
        assert_eq!(cat.docs[2].signature, "divisors(n: int) -> list[int]");
        // catalog includes signature-less entries and core types, not headings with spaces
        assert!(cat.names.contains(&"totient".to_string()));
        assert!(cat.names.contains(&"Polynomial".to_string()));
        assert!(!cat.names.iter().any(|n| n.contains(' ')));
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Is 2^127 - 1 prime? of is_prime"), vec!["prime", "is_prime"]);
    }

    #[test]
    fn test_name_hits_weigh_more() {
        let cat = parse_api_md(API_MD);
        let tokens = tokenize("divisors");
        assert_eq!(score(&cat.docs[2], &tokens), 3);
        let tokens = tokenize("greater");
        assert_eq!(score(&cat.docs[1], &tokens), 1);
    }

    #[test]
    fn test_rank_ties_keep_catalog_order() {
        let cat = parse_api_md(API_MD);
        let ranked: Vec<_> = cat.rank("prime", 8).iter().map(|d| d.name.clone()).collect();
        assert_eq!(ranked, vec!["is_prime", "next_prime"]);
    }

    #[test]
    fn test_rank_falls_back_to_common_entries() {
        let cat = builtin();
        let ranked: Vec<_> = cat.rank("xyzzy qwerty", 8).iter().map(|d| d.name.clone()).collect();
        assert_eq!(ranked, vec!["is_prime", "primes", "prime_factors", "divisors", "totient", "crt"]);
    }

    #[test]
    fn test_snippets_prefix_namespace() {
        let cat = parse_api_md(API_MD);
        let text = cat.snippets("divisors of 360", 8);
        assert_eq!(text, "- nt.divisors(n: int) -> list[int] — Divisors of n.");
        assert_eq!(DocCatalog::default().snippets("x", 8), "- (API docs not loaded)");
    }
}
