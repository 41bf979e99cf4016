//! IPAM-backed ranges driven by an in-process fake plugin.

use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use vnet_addrange::{
    AddressTarget, ErrorClass, FreeCheck, Owner, RangeContext, RangeError, RangePool,
};
use vnet_ipam::{mock, DriverReply, DriverRequest, IpamAction, IpamConfig, IpamError};
use vnet_types::{parse_ipv4, Template};

type Log = Arc<Mutex<Vec<DriverRequest>>>;

/// Connects a fake plugin. `answer` returns the reply payload (`Ok`) or
/// failure reason (`Err`), or `None` to leave the request unanswered.
fn plugin<F>(timeout_secs: u64, mut answer: F) -> (RangeContext, Log)
where
    F: FnMut(&DriverRequest) -> Option<Result<String, String>> + Send + 'static,
{
    let log: Log = Arc::default();
    let seen = Arc::clone(&log);
    let config = IpamConfig {
        timeout_secs,
        ..IpamConfig::default()
    };
    let manager = mock::connect(config, move |req| {
        seen.lock().unwrap().push(req.clone());
        Some(match answer(&req)? {
            Ok(info) => DriverReply::success(req.action, req.id, info),
            Err(reason) => DriverReply::failure(req.action, req.id, reason),
        })
    });
    (RangeContext::default().with_ipam(manager), log)
}

fn actions(log: &Log) -> Vec<IpamAction> {
    log.lock().unwrap().iter().map(|r| r.action).collect()
}

fn definition(pairs: &[(&str, &str)]) -> Template {
    pairs.iter().copied().collect()
}

fn ip(text: &str) -> AddressTarget {
    AddressTarget::Ip(parse_ipv4(text).unwrap())
}

const REGISTERED: &str = r#"{"IP":"10.20.0.1","SIZE":"8","GATEWAY":"10.20.0.254"}"#;

fn ipam_definition() -> Template {
    definition(&[("TYPE", "IP4"), ("IPAM_MAD", "infoblox")])
}

#[tokio::test]
async fn register_adopts_plugin_attributes() {
    let (ctx, log) = plugin(5, |req| match req.action {
        IpamAction::RegisterAddressRange => Some(Ok(REGISTERED.to_string())),
        _ => Some(Ok(String::new())),
    });
    let mut pool = RangePool::new(ctx);
    let id = pool.add_range(&ipam_definition()).await.unwrap();

    let ar = pool.get(id).unwrap();
    assert!(ar.is_ipam());
    assert_eq!(ar.ipam_mad(), Some("infoblox"));
    assert_eq!(ar.size(), 8);
    assert_eq!(ar.attributes().get("GATEWAY"), Some("10.20.0.254"));

    let sent = log.lock().unwrap()[0].clone();
    assert_eq!(sent.action, IpamAction::RegisterAddressRange);
    let range = sent.address_range.unwrap();
    assert_eq!(range.get("AR_ID"), Some("0"));
    assert_eq!(range.get("IPAM_MAD"), Some("infoblox"));
}

#[tokio::test]
async fn rejected_registration_is_unregistered() {
    let (ctx, log) = plugin(5, |req| match req.action {
        IpamAction::RegisterAddressRange => Some(Ok(r#"{"IP":"10.20.0.1","SIZE":"0"}"#.to_string())),
        _ => Some(Ok(String::new())),
    });
    let mut pool = RangePool::new(ctx);
    let err = pool.add_range(&ipam_definition()).await.unwrap_err();
    assert!(matches!(err, RangeError::InvalidField { ref field, .. } if field == "SIZE"));
    assert!(pool.is_empty());
    assert_eq!(
        actions(&log),
        vec![IpamAction::RegisterAddressRange, IpamAction::UnregisterAddressRange]
    );
}

#[tokio::test]
async fn plugin_picks_the_next_address() {
    let (ctx, log) = plugin(5, |req| match req.action {
        IpamAction::RegisterAddressRange => Some(Ok(REGISTERED.to_string())),
        IpamAction::GetAddress => Some(Ok(r#"{"IP":"10.20.0.6"}"#.to_string())),
        _ => Some(Ok(String::new())),
    });
    let mut pool = RangePool::new(ctx);
    pool.add_range(&ipam_definition()).await.unwrap();

    let mut lease = Template::new();
    pool.allocate(&AddressTarget::Next, Owner::vm(3), &mut lease, None, FreeCheck::Strict)
        .await
        .unwrap();
    assert_eq!(lease.get("IP"), Some("10.20.0.6"));
    assert_eq!(lease.get("GATEWAY"), Some("10.20.0.254"));
    assert_eq!(pool.used(), 1);

    let get = log.lock().unwrap()[1].clone();
    assert_eq!(get.action, IpamAction::GetAddress);
    assert_eq!(get.address.unwrap().get("SIZE"), Some("1"));

    pool.free(&ip("10.20.0.6"), Owner::vm(3), None).await.unwrap();
    let free = log.lock().unwrap()[2].clone();
    assert_eq!(free.action, IpamAction::FreeAddress);
    let address = free.address.unwrap();
    assert_eq!(address.get("IP"), Some("10.20.0.6"));
    assert_eq!(address.get("SIZE"), Some("1"));
    assert_eq!(pool.used(), 0);
}

#[tokio::test]
async fn untrusted_plugin_answers_change_nothing() {
    let answers = Arc::new(Mutex::new(vec![
        r#"{"IP":"10.20.0.2"}"#,
        r#"{"IP":"10.20.0.2"}"#,
        r#"{"IP":"10.99.0.1"}"#,
        r#"{"MAC":"02:00:0a:14:00:03"}"#,
        r#"{"IP":"not an address"}"#,
    ]));
    let queue = Arc::clone(&answers);
    let (ctx, _log) = plugin(5, move |req| match req.action {
        IpamAction::RegisterAddressRange => Some(Ok(REGISTERED.to_string())),
        IpamAction::GetAddress => Some(Ok(queue.lock().unwrap().remove(0).to_string())),
        _ => Some(Ok(String::new())),
    });
    let mut pool = RangePool::new(ctx);
    pool.add_range(&ipam_definition()).await.unwrap();

    pool.allocate(&AddressTarget::Next, Owner::vm(1), &mut Template::new(), None, FreeCheck::Strict)
        .await
        .unwrap();
    let before = pool.to_templates();

    for _ in 0..4 {
        let mut lease = Template::new();
        let err = pool
            .allocate(&AddressTarget::Next, Owner::vm(2), &mut lease, None, FreeCheck::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, RangeError::UntrustedAddress { .. }), "{err}");
        assert_eq!(err.class(), ErrorClass::External);
        assert!(lease.is_empty());
    }
    assert_eq!(pool.to_templates(), before);
    assert_eq!(pool.used(), 1);
    assert!(answers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn plugin_failure_reason_is_verbatim() {
    let (ctx, log) = plugin(5, |req| match req.action {
        IpamAction::RegisterAddressRange => Some(Ok(REGISTERED.to_string())),
        IpamAction::AllocateAddress => Some(Err("10.20.0.4 is reserved upstream".to_string())),
        _ => Some(Ok(String::new())),
    });
    let mut pool = RangePool::new(ctx);
    pool.add_range(&ipam_definition()).await.unwrap();

    let err = pool
        .allocate(&ip("10.20.0.4"), Owner::vm(1), &mut Template::new(), None, FreeCheck::Strict)
        .await
        .unwrap_err();
    match err {
        RangeError::Ipam(IpamError::Failure { action, ref reason }) => {
            assert_eq!(action, IpamAction::AllocateAddress);
            assert_eq!(reason, "10.20.0.4 is reserved upstream");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(pool.used(), 0);

    let allocate = log.lock().unwrap()[1].clone();
    assert_eq!(allocate.address.unwrap().get("IP"), Some("10.20.0.4"));
}

#[tokio::test(start_paused = true)]
async fn silent_plugin_times_out() {
    let (ctx, _log) = plugin(2, |req| match req.action {
        IpamAction::RegisterAddressRange => Some(Ok(REGISTERED.to_string())),
        _ => None,
    });
    let mut pool = RangePool::new(ctx);
    pool.add_range(&ipam_definition()).await.unwrap();

    let err = pool
        .allocate(&AddressTarget::Next, Owner::vm(1), &mut Template::new(), None, FreeCheck::Strict)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RangeError::Ipam(IpamError::Timeout {
            action: IpamAction::GetAddress,
            ..
        })
    ));
    assert_eq!(pool.used(), 0);
    let manager = pool.context().ipam().unwrap();
    assert_eq!(manager.pending_count(), 0);
}

#[tokio::test]
async fn reservation_confirms_block_with_plugin() {
    let (ctx, log) = plugin(5, |req| match req.action {
        IpamAction::RegisterAddressRange => Some(Ok(REGISTERED.to_string())),
        _ => Some(Ok(String::new())),
    });
    let mut pool = RangePool::new(ctx);
    pool.add_range(&ipam_definition()).await.unwrap();

    let child = pool.reserve(12, 3, Some(0), Some(&ip("10.20.0.5"))).await.unwrap();
    assert!(!child.contains("IPAM_MAD"));
    assert_eq!(child.get("IP"), Some("10.20.0.5"));
    assert_eq!(pool.used(), 3);

    let allocate = log.lock().unwrap()[1].clone();
    assert_eq!(allocate.action, IpamAction::AllocateAddress);
    assert_eq!(allocate.address.unwrap().get("SIZE"), Some("3"));

    // The reservation is a local range over addresses the parent's plugin
    // already handed out.
    let local = RangePool::new(RangeContext::default())
        .add_range(&child)
        .await;
    assert!(local.is_ok());
}

#[tokio::test]
async fn remove_unregisters_and_honors_force() {
    let refuse = Arc::new(Mutex::new(true));
    let flag = Arc::clone(&refuse);
    let (ctx, log) = plugin(5, move |req| match req.action {
        IpamAction::RegisterAddressRange => Some(Ok(REGISTERED.to_string())),
        IpamAction::UnregisterAddressRange if *flag.lock().unwrap() => {
            Some(Err("range is still referenced".to_string()))
        }
        _ => Some(Ok(String::new())),
    });
    let mut pool = RangePool::new(ctx);
    pool.add_range(&ipam_definition()).await.unwrap();
    pool.add_range(&ipam_definition()).await.unwrap();

    let err = pool.remove_range(0, false).await.unwrap_err();
    assert!(err.to_string().contains("range is still referenced"));
    assert_eq!(pool.len(), 2);

    pool.remove_range(0, true).await.unwrap();
    assert_eq!(pool.len(), 1);

    *refuse.lock().unwrap() = false;
    pool.remove_range(1, false).await.unwrap();
    assert!(pool.is_empty());

    let unregister = log
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.action == IpamAction::UnregisterAddressRange)
        .count();
    assert_eq!(unregister, 3);
}

#[tokio::test]
async fn range_without_driver_is_refused() {
    let mut pool = RangePool::new(RangeContext::default());
    let err = pool.add_range(&ipam_definition()).await.unwrap_err();
    assert!(matches!(err, RangeError::NoIpamDriver { ref mad } if mad == "infoblox"));
}

#[tokio::test]
async fn reservation_rejects_untrusted_plugin_blocks() {
    let answers = Arc::new(Mutex::new(vec![
        r#"{"IP":"10.20.0.7"}"#,
        r#"{"IP":"10.20.0.1"}"#,
        r#"{"IP":"10.20.0.4"}"#,
    ]));
    let queue = Arc::clone(&answers);
    let (ctx, _log) = plugin(5, move |req| match req.action {
        IpamAction::RegisterAddressRange => Some(Ok(REGISTERED.to_string())),
        IpamAction::GetAddress => Some(Ok(queue.lock().unwrap().remove(0).to_string())),
        _ => Some(Ok(String::new())),
    });
    let mut pool = RangePool::new(ctx);
    pool.add_range(&ipam_definition()).await.unwrap();
    pool.allocate(&ip("10.20.0.2"), Owner::vm(1), &mut Template::new(), None, FreeCheck::Strict)
        .await
        .unwrap();
    let before = pool.to_templates();

    // The first block runs past the last address and the second overlaps
    // the lease of 10.20.0.2.
    for _ in 0..2 {
        let err = pool.reserve(30, 3, None, None).await.unwrap_err();
        assert!(matches!(err, RangeError::UntrustedAddress { .. }), "{err}");
        assert_eq!(pool.to_templates(), before);
        assert_eq!(pool.used(), 1);
    }

    let child = pool.reserve(30, 3, None, None).await.unwrap();
    assert_eq!(child.get("IP"), Some("10.20.0.4"));
    assert_eq!(pool.used(), 4);
    assert!(answers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn plugin_failure_mid_release_keeps_earlier_frees() {
    let mut frees = 0;
    let (ctx, _log) = plugin(5, move |req| match req.action {
        IpamAction::RegisterAddressRange => Some(Ok(REGISTERED.to_string())),
        IpamAction::FreeAddress => {
            frees += 1;
            if frees == 1 {
                Some(Ok(String::new()))
            } else {
                Some(Err("lease is locked upstream".to_string()))
            }
        }
        _ => Some(Ok(String::new())),
    });
    let mut pool = RangePool::new(ctx);
    pool.add_range(&ipam_definition()).await.unwrap();
    for address in ["10.20.0.3", "10.20.0.5"] {
        pool.allocate(&ip(address), Owner::vm(4), &mut Template::new(), None, FreeCheck::Strict)
            .await
            .unwrap();
    }

    let err = pool.free_by_owner(Owner::vm(4)).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::External);
    assert!(err.to_string().contains("lease is locked upstream"));

    let ar = pool.get(0).unwrap();
    assert_eq!(ar.owner_of(&ip("10.20.0.3")), None);
    assert_eq!(ar.owner_of(&ip("10.20.0.5")), Some(Owner::vm(4)));
    assert_eq!(pool.used(), 1);
    assert_eq!(ar.used(), 1);
}
