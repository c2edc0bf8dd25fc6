use super::*;

#[test]
fn test_default_policy() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.base_delay, Duration::from_secs(60));
    assert_eq!(policy.max_delay, Duration::from_secs(240));
    assert_eq!(policy.max_attempts, 3);
}

#[test]
fn test_sweeper_cadence_doubles_then_caps() {
    let policy = RetryPolicy::for_sweeper(Duration::from_secs(60), Duration::from_secs(240), 3);

    assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
    assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(120));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(240));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
    assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(240));
}

#[test]
fn test_cap_never_below_base() {
    let policy = RetryPolicy::for_sweeper(Duration::from_secs(60), Duration::from_secs(10), 3);
    assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
}

#[test]
fn test_reconcile_backoff_is_twice_poll_capped() {
    let policy = RetryPolicy::for_reconcile(Duration::from_secs(30), Duration::from_secs(60), 5);
    assert_eq!(policy.extended_delay(), Duration::from_secs(60));

    let capped = RetryPolicy::for_reconcile(Duration::from_secs(30), Duration::from_secs(45), 5);
    assert_eq!(capped.extended_delay(), Duration::from_secs(45));

    // Cap below the poll interval still wins
    let tight = RetryPolicy::for_reconcile(Duration::from_secs(30), Duration::from_secs(10), 5);
    assert_eq!(tight.extended_delay(), Duration::from_secs(10));
}

#[test]
fn test_reconcile_threshold() {
    let policy = RetryPolicy::for_reconcile(Duration::from_millis(10), Duration::from_millis(20), 2);
    assert!(policy.should_retry(1));
    assert!(!policy.should_retry(2));
}

#[test]
fn test_should_retry() {
    let policy = RetryPolicy::for_sweeper(Duration::from_secs(1), Duration::from_secs(4), 3);

    assert!(policy.should_retry(0));
    assert!(policy.should_retry(2));
    assert!(!policy.should_retry(3));
    assert!(!policy.should_retry(4));
}
