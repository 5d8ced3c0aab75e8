// Extraction of GPU indices from a Slurm GRES descriptor.
//
// In `scontrol show jobs -d` output the per-node allocation looks like
//
//   GRES=gpu:ampere:4(IDX:0-1,3,6)
//
// where the parenthesized group lists the device indices on that node, each element being a number
// or an inclusive range.

use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::warn;

// No node has more devices than this; a wider range is a corrupt descriptor.
const MAX_INDEX_RANGE: u32 = 1024;

/// Return the GPU indices named by `gres`, ascending, without duplicates, in canonical decimal form.
///
/// Elements that are not numbers or number ranges are skipped, as are ranges spanning more than
/// `MAX_INDEX_RANGE` devices.  A descriptor without a usable index group yields the empty vector.
/// Problems are logged; this never fails.

pub fn parse_gres(gres: &str) -> Vec<String> {
    let group = match index_group(gres) {
        Some(group) => group,
        None => {
            warn!("parse_gres: no gpu index group (likely empty): {gres:?}");
            return vec![];
        }
    };
    let index_list = match group.split_once(':') {
        Some((_label, index_list)) => index_list,
        None => {
            warn!("parse_gres: gpu index group without label: {gres:?}");
            return vec![];
        }
    };

    let mut indices = BTreeSet::new();
    for elt in index_list.split(',') {
        if elt.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = elt.split_once('-') {
            match (u32::from_str(lo), u32::from_str(hi)) {
                (Ok(lo), Ok(hi)) if hi.saturating_sub(lo) <= MAX_INDEX_RANGE => indices.extend(lo..=hi),
                _ => warn!("parse_gres: parsing gpu index range {elt:?} in {gres:?}"),
            }
        } else {
            match u32::from_str(elt) {
                Ok(ix) => {
                    indices.insert(ix);
                }
                Err(_) => warn!("parse_gres: parsing gpu index {elt:?} in {gres:?}"),
            }
        }
    }
    if indices.is_empty() {
        warn!("parse_gres: empty gpu index list: {gres:?}");
    }
    indices.into_iter().map(|ix| ix.to_string()).collect()
}

// The contents of the first nonempty parenthesized group.

fn index_group(gres: &str) -> Option<&str> {
    let mut rest = gres;
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        let close = after.find(')')?;
        if close > 0 {
            return Some(&after[..close]);
        }
        rest = &after[close + 1..];
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_gres() {
        assert_eq!(parse_gres("gpu:ampere:1(IDX:0-1,3-4,6-7)"), strings(&["0", "1", "3", "4", "6", "7"]));
        assert_eq!(parse_gres("gpu:ampere:1(IDX:0,2-3,5)"), strings(&["0", "2", "3", "5"]));
        assert_eq!(parse_gres("gpu:ampere:1(IDX:0-2,4,5-7)"), strings(&["0", "1", "2", "4", "5", "6", "7"]));
        assert_eq!(parse_gres("gpu:ampere:1(IDX:0,2-3)"), strings(&["0", "2", "3"]));
        assert_eq!(parse_gres("gpu:ampere:1(IDX:0,2,4)"), strings(&["0", "2", "4"]));
        assert_eq!(parse_gres("gpu:ampere:1(IDX:1-3)"), strings(&["1", "2", "3"]));
        assert_eq!(parse_gres("gpu:8(IDX:0-7)"), strings(&["0", "1", "2", "3", "4", "5", "6", "7"]));
    }

    #[test]
    fn test_parse_gres_ascending_union() {
        // Out-of-order and overlapping elements still come out as a sorted set.
        assert_eq!(parse_gres("gpu:h100:4(IDX:6,0-2,1,10)"), strings(&["0", "1", "2", "6", "10"]));
        assert_eq!(parse_gres("gpu:h100:1(IDX:03)"), strings(&["3"]));
    }

    #[test]
    fn test_parse_gres_malformed() {
        assert!(parse_gres("gpu:ampere:1(IDX:)").is_empty());
        assert!(parse_gres("").is_empty());
        assert!(parse_gres("malformed string").is_empty());
        assert!(parse_gres("gpu:ampere:1(0-3)").is_empty());
        assert!(parse_gres("gpu:ampere:1()").is_empty());
        assert!(parse_gres("gpu:ampere:1(IDX:a-b,x)").is_empty());
        assert!(parse_gres("gpu:ampere:1(IDX:0-3").is_empty());

        // A bad element does not spoil the good ones.
        assert_eq!(parse_gres("gpu:ampere:2(IDX:x,2)"), strings(&["2"]));

        // Implausibly wide ranges are skipped, not expanded.
        assert!(parse_gres("gpu:ampere:1(IDX:0-4294967295)").is_empty());
        assert_eq!(parse_gres("gpu:ampere:2(IDX:1,5-100000)"), strings(&["1"]));
        assert_eq!(parse_gres("gpu:ampere:2(IDX:0-1024)").len(), 1025);
    }
}
