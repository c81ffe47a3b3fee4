// crates/meqcore/tests/request_id_test.rs

use meqcore::{symdeps, DependMask, RequestId, ResultCode};
use proptest::prelude::*;

fn rqid(ids: &[u32]) -> RequestId {
    RequestId::from(ids)
}

#[test]
fn test_bit_zero_addresses_last_component() {
    let id = rqid(&[7, 8, 9]);
    assert_eq!(id.sub_id(0), Some(9));
    assert_eq!(id.sub_id(2), Some(7));
    assert_eq!(id.sub_id(3), None);
}

#[test]
fn test_masked_equal_ignores_unmasked_positions() {
    let a = rqid(&[1, 2, 3]);
    let b = rqid(&[1, 5, 3]);
    assert!(a.masked_equal(&b, DependMask::new(0b101)));
    assert!(!a.masked_equal(&b, DependMask::new(0b010)));
}

#[test]
fn test_empty_ids_never_match() {
    let a = RequestId::empty();
    let b = rqid(&[1]);
    assert!(!a.masked_equal(&b, DependMask::NONE));
    assert!(!a.masked_equal(&a, DependMask::ALL));
    assert_eq!(a.diff_mask(&b), DependMask::ALL);
}

#[test]
fn test_length_mismatch_counts_as_difference() {
    let a = rqid(&[4, 1]);
    let b = rqid(&[1]);
    assert_eq!(a.diff_mask(&b), DependMask::new(0b10));
    assert!(a.masked_equal(&b, DependMask::new(0b01)));
    assert!(!a.masked_equal(&b, DependMask::new(0b10)));
}

#[test]
fn test_incr_sub_id_grows_at_front() {
    let mut id = rqid(&[5]);
    let domain = symdeps::default_mask(symdeps::DOMAIN).unwrap();
    id.incr_sub_id(domain);
    assert_eq!(id, rqid(&[1, 0, 0, 5]));

    let iteration = symdeps::default_mask(symdeps::ITERATION).unwrap();
    id.incr_sub_id(iteration);
    assert_eq!(id, rqid(&[1, 0, 0, 6]));
}

#[test]
fn test_parse_and_display() {
    let id: RequestId = "1.2.30".parse().unwrap();
    assert_eq!(id, rqid(&[1, 2, 30]));
    assert_eq!(id.to_string(), "1.2.30");
    assert!("".parse::<RequestId>().unwrap().is_empty());
    assert!("1.x".parse::<RequestId>().is_err());
}

#[test]
fn test_result_code_accumulates_dependency_bits() {
    let mut code = ResultCode::FAIL;
    code |= DependMask::new(0x1);
    code |= DependMask::new(0x8);
    assert!(code.is_fail());
    assert_eq!(code.depend_mask(), DependMask::new(0x9));
}

proptest! {
    #[test]
    fn prop_ids_match_outside_their_diff_mask(
        a in proptest::collection::vec(0u32..4, 1..6),
        b in proptest::collection::vec(0u32..4, 1..6),
    ) {
        let a = RequestId::from(a);
        let b = RequestId::from(b);
        let diff = a.diff_mask(&b);
        prop_assert!(a.masked_equal(&b, !diff));
        if !diff.is_empty() {
            prop_assert!(!a.masked_equal(&b, diff));
        }
    }

    #[test]
    fn prop_incr_changes_exactly_the_masked_positions(
        ids in proptest::collection::vec(0u32..100, 1..6),
        bits in 0u32..0x3F,
    ) {
        let len = ids.len();
        let before = RequestId::from(ids);
        let mask = DependMask::new(bits & ((1 << len) - 1));
        let mut after = before.clone();
        after.incr_sub_id(mask);
        prop_assert_eq!(after.diff_mask(&before), mask);
        prop_assert_eq!(after.len(), before.len());
    }
}
