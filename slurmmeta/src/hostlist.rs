// Matching of host names against Slurm hostlists.
//
// A hostlist is either a plain host name or a prefix followed by a bracketed set of numbers, see
// https://github.com/SchedMD/slurm/blob/main/src/common/hostlist.h.  Grammar for the bracketed
// form:
//
//  hostlist ::= prefix '[' range ("," range)* ']'
//  prefix ::= <ASCII letter or '-'> +
//  range ::= number | number "-" number
//
// The ranges are never expanded, the number of the host name is simply tested against them.

use anyhow::{bail, Result};
use std::str::FromStr;
use tracing::warn;

/// Return true iff `hostname` is one of the hosts denoted by `hostlist`.
///
/// This never fails: a malformed hostlist or a host name without the numeric suffix simply does not
/// match, and the problem is logged.

pub fn hostname_in_list(hostname: &str, hostlist: &str) -> bool {
    if !hostlist.contains('[') {
        return !hostname.is_empty() && hostname == hostlist;
    }

    let parsed = match parse_hostlist(hostlist) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("hostname_in_list: malformed hostlist {hostlist}: {e}");
            return false;
        }
    };

    let suffix = match hostname.strip_prefix(&parsed.prefix) {
        Some(suffix) => suffix,
        None => return false,
    };
    let host_num = match u64::from_str(suffix) {
        Ok(n) => n,
        Err(e) => {
            warn!("hostname_in_list: parsing hostname {hostname}: {e}");
            return false;
        }
    };

    parsed.ranges.iter().any(|(lo, hi)| *lo <= host_num && host_num <= *hi)
}

/// Return the value of the first `NodeList=` field in a block of `scontrol show jobs` output, or ""
/// if there is none.

pub fn hostlist_of(block: &str) -> &str {
    for field in block.split_whitespace() {
        if let Some(("NodeList", value)) = field.split_once('=') {
            return value;
        }
    }
    ""
}

#[derive(Debug, PartialEq)]
struct Hostlist {
    prefix: String,
    ranges: Vec<(u64, u64)>,  // Inclusive
}

fn parse_hostlist(s: &str) -> Result<Hostlist> {
    let mut parser = Parser::new(s);
    let prefix = parser.parse_prefix()?;
    parser.match_char('[')?;
    let ranges = parser.parse_brackets()?;
    if !parser.at_end() {
        bail!("Junk after ']'");
    }
    Ok(Hostlist { prefix, ranges })
}

struct Parser {
    input: Vec<char>,           // Vector of input characters
    i: usize,                   // Index into input
    lim: usize,                 // Length of input
}

impl Parser {
    fn new(s: &str) -> Parser {
        let input = s.chars().collect::<Vec<char>>();
        let lim = input.len();
        Parser { input, i: 0, lim }
    }

    // Consumes the prefix, does not consume the '['.

    fn parse_prefix(&mut self) -> Result<String> {
        let mut prefix = "".to_string();
        while !self.at_end() && (self.input[self.i].is_ascii_alphabetic() || self.input[self.i] == '-') {
            prefix.push(self.input[self.i]);
            self.i += 1;
        }
        if prefix.is_empty() {
            bail!("Expected host name prefix");
        }
        Ok(prefix)
    }

    // The '[' has been eaten, and this consumes the ']' but does not look beyond that.

    fn parse_brackets(&mut self) -> Result<Vec<(u64, u64)>> {
        let mut lst = vec![self.parse_range()?];
        while self.peek()? != ']' {
            self.match_char(',')?;
            lst.push(self.parse_range()?);
        }
        self.match_char(']')?;
        Ok(lst)
    }

    // Consumes either m or m-n, peeks at the next input element.

    fn parse_range(&mut self) -> Result<(u64, u64)> {
        let m = self.parse_number()?;
        if self.peek()? == '-' {
            self.get()?;
            let n = self.parse_number()?;
            Ok((m, n))
        } else {
            Ok((m, m))
        }
    }

    // Consumes digits, errors out on an empty string.

    fn parse_number(&mut self) -> Result<u64> {
        let start = self.i;
        while self.i < self.lim && self.input[self.i].is_ascii_digit() {
            self.i += 1;
        }
        if self.i == start {
            bail!("Expected number");
        }
        let s = self.input[start..self.i].iter().collect::<String>();
        Ok(u64::from_str(&s)?)
    }

    // Input stream abstraction

    fn match_char(&mut self, c: char) -> Result<()> {
        if self.get()? != c {
            bail!("Expected {c}");
        }
        Ok(())
    }

    fn get(&mut self) -> Result<char> {
        let c = self.peek()?;
        self.i += 1;
        Ok(c)
    }

    fn peek(&self) -> Result<char> {
        if self.at_end() {
            bail!("Unexpected end of input")
        }
        Ok(self.input[self.i])
    }

    fn at_end(&self) -> bool {
        self.i == self.lim
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hostname_in_list() {
        assert!(hostname_in_list("node1", "node1"));
        assert!(hostname_in_list("node1", "node[0-2]"));
        assert!(hostname_in_list("node1", "node[1-2]"));
        assert!(hostname_in_list("node3", "node[0-1,3-4]"));
        assert!(hostname_in_list("node3", "node[0-1,3,5-6]"));
        assert!(hostname_in_list("node6", "node[0-1,3,5-6]"));
        assert!(!hostname_in_list("node1", "node[2-10]"));
        assert!(!hostname_in_list("node2", "node[0-1,3-4]"));
        assert!(!hostname_in_list("node4", "node[0-1,3,5-6]"));
        assert!(!hostname_in_list("node7", "node[0-1,3,5-6]"));
        assert!(!hostname_in_list("", ""));
    }

    #[test]
    fn test_plain_hostlist_is_equality() {
        assert!(!hostname_in_list("node12", "node1"));
        assert!(!hostname_in_list("node1", "node1,node2"));
        assert!(!hostname_in_list("", "node1"));
        assert!(hostname_in_list("gpu-a-7", "gpu-a-7"));
    }

    #[test]
    fn test_multi_node_hostlist() {
        let hl = "node[1433,1787,1795,1854,1889-1890,1968-1969]";
        assert!(hostname_in_list("node1433", hl));
        assert!(hostname_in_list("node1890", hl));
        assert!(hostname_in_list("node1969", hl));
        assert!(!hostname_in_list("node1751", hl));
        assert!(!hostname_in_list("node1891", hl));

        // Leading zeroes are numbers like any other.
        assert!(hostname_in_list("node07", "node[01-10]"));
    }

    #[test]
    fn test_malformed_hostlist() {
        assert!(!hostname_in_list("node1", "node[1-x]"));
        assert!(!hostname_in_list("node1", "node[1,]"));
        assert!(!hostname_in_list("node1", "node[1-2"));
        assert!(!hostname_in_list("node1", "node[1]x"));
        assert!(!hostname_in_list("node1", "[1-2]"));
        assert!(!hostname_in_list("node1", "node7[1-2]"));
        assert!(!hostname_in_list("nodex", "node[1-2]"));
        assert!(!hostname_in_list("gpu1", "node[1-2]"));
    }

    #[test]
    fn test_parse_hostlist() {
        assert_eq!(
            parse_hostlist("c-node[3,5-7]").unwrap(),
            Hostlist { prefix: "c-node".to_string(), ranges: vec![(3, 3), (5, 7)] }
        );
        assert!(parse_hostlist("node[]").is_err());
    }

    #[test]
    fn test_hostlist_of() {
        let block = "JobId=30214 JobName=demo\n   ReqNodeList=(null) ExcNodeList=(null)\n   NodeList=node[1-3]\n   BatchHost=node1\n";
        assert_eq!(hostlist_of(block), "node[1-3]");
        assert_eq!(hostlist_of("JobId=1 JobName=x"), "");
    }
}
