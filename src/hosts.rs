//! Hosts blocklist file reader, a trivial line-oriented input contract.
//! Grounded on the original `read_hosts()`: trim the
//! line, `#` truncates to a comment, split on the first run of
//! whitespace, and every token after that — except the literal
//! `localhost` — is a blocked name.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::Result;

pub fn read_hosts(path: &Path) -> Result<HashSet<String>> {
    let contents = fs::read_to_string(path)?;
    Ok(parse_hosts(&contents))
}

pub fn parse_hosts(contents: &str) -> HashSet<String> {
    let mut blocked = HashSet::new();
    for raw_line in contents.lines() {
        let line = match raw_line.find('#') {
            Some(idx) => &raw_line[..idx],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        // First token is conventionally an address; skip it.
        tokens.next();
        for token in tokens {
            if token != "localhost" {
                blocked.insert(token.to_string());
            }
        }
    }
    blocked
}
