use super::*;

#[test]
fn test_default_config() {
    let config = RetryConfig::default();
    assert_eq!(config.base_delay, Duration::from_secs(1));
    assert_eq!(config.max_delay, Duration::from_secs(60));
}

#[test]
fn test_backoff_schedule() {
    assert_eq!(backoff(1), Duration::from_secs(1));
    assert_eq!(backoff(2), Duration::from_secs(2));
    assert_eq!(backoff(3), Duration::from_secs(4));
    assert_eq!(backoff(4), Duration::from_secs(8));
    assert_eq!(backoff(6), Duration::from_secs(32));
}

#[test]
fn test_backoff_zero_treated_as_first_delivery() {
    assert_eq!(backoff(0), Duration::from_secs(1));
}

#[test]
fn test_backoff_capped_at_max() {
    assert_eq!(backoff(7), Duration::from_secs(60));
    assert_eq!(backoff(40), Duration::from_secs(60));
    assert_eq!(backoff(u64::MAX), Duration::from_secs(60));
}

#[test]
fn test_backoff_is_monotonic() {
    let mut previous = Duration::ZERO;
    for n in 0..100 {
        let delay = backoff(n);
        assert!(delay >= previous, "backoff({}) = {:?} < {:?}", n, delay, previous);
        previous = delay;
    }
}

#[test]
fn test_custom_config() {
    let config = RetryConfig {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(500),
    };

    assert_eq!(config.delay_for_delivery(1), Duration::from_millis(100));
    assert_eq!(config.delay_for_delivery(3), Duration::from_millis(400));
    assert_eq!(config.delay_for_delivery(4), Duration::from_millis(500));
}
