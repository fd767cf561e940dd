//! Address pool tests
//!
//! Covers allocation uniqueness, exhaustion and release behavior of the
//! IP address manager, including property-based checks over random
//! assign/release sequences.

use common::test_utils::create_mock_interface;
use daemon::config::PoolSettings;
use daemon::{IpAddressManager, IpamError};
use proptest::prelude::*;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

fn pool(prefix_len: u8) -> PoolSettings {
    PoolSettings {
        subnet: Ipv4Addr::new(10, 90, 0, 0),
        prefix_len,
        host_address: Some(Ipv4Addr::new(10, 90, 0, 1)),
        gateway: None,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_pool_exhaustion_and_recovery() {
    // /29: six usable addresses, one taken by the host
    let ipam = IpAddressManager::new(pool(29));
    ipam.initialize().await.unwrap();
    assert_eq!(ipam.available().await, 5);

    let interfaces: Vec<_> = (0..5)
        .map(|i| create_mock_interface(&format!("dev-{}", i), "usb0"))
        .collect();
    for interface in &interfaces {
        ipam.assign(interface).await.unwrap();
    }

    let extra = create_mock_interface("dev-5", "usb0");
    assert!(matches!(
        ipam.assign(&extra).await,
        Err(IpamError::PoolExhausted)
    ));

    let freed = ipam.release(&interfaces[2]).await.unwrap();
    let reassigned = ipam.assign(&extra).await.unwrap();
    assert_eq!(reassigned.ip_address, freed.ip_address);
}

#[tokio::test]
async fn test_lowest_free_address_is_reused_first() {
    let ipam = IpAddressManager::new(pool(24));
    ipam.initialize().await.unwrap();

    let a = create_mock_interface("dev-a", "usb0");
    let b = create_mock_interface("dev-b", "usb0");
    let c = create_mock_interface("dev-c", "usb0");
    ipam.assign(&a).await.unwrap();
    ipam.assign(&b).await.unwrap();
    ipam.assign(&c).await.unwrap();

    ipam.release(&a).await;
    let d = ipam
        .assign(&create_mock_interface("dev-d", "usb0"))
        .await
        .unwrap();
    assert_eq!(d.ip_address, Ipv4Addr::new(10, 90, 0, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assignments_are_unique() {
    let ipam = Arc::new(IpAddressManager::new(pool(24)));
    ipam.initialize().await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..100 {
        let ipam = ipam.clone();
        tasks.spawn(async move {
            ipam.assign(&create_mock_interface(&format!("dev-{}", i), "usb0"))
                .await
                .unwrap()
                .ip_address
        });
    }

    let mut seen = HashSet::new();
    while let Some(address) = tasks.join_next().await {
        assert!(seen.insert(address.unwrap()));
    }
    assert_eq!(seen.len(), 100);
    assert_eq!(ipam.available().await, 253 - 100);
}

#[derive(Debug, Clone)]
enum Op {
    Assign(usize),
    Release(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..20).prop_map(Op::Assign),
        (0usize..20).prop_map(Op::Release),
    ]
}

proptest! {
    /// Any N interfaces drawn from a pool of size >= N get distinct addresses
    #[test]
    fn prop_assignments_are_pairwise_distinct(
        keys in proptest::collection::hash_set(("[a-z]{1,4}", "usb[0-3]"), 1..60),
    ) {
        let rt = runtime();
        let addresses: Vec<Ipv4Addr> = rt.block_on(async {
            let ipam = IpAddressManager::new(pool(24));
            ipam.initialize().await.unwrap();
            let mut addresses = Vec::new();
            for (device, name) in &keys {
                let config = ipam.assign(&create_mock_interface(device, name)).await.unwrap();
                addresses.push(config.ip_address);
            }
            addresses
        });

        let unique: HashSet<_> = addresses.iter().collect();
        prop_assert_eq!(unique.len(), keys.len());
        prop_assert!(!addresses.contains(&Ipv4Addr::new(10, 90, 0, 1)));
    }

    /// Free plus allocated always equals the pool size, and live
    /// allocations never share an address
    #[test]
    fn prop_assign_release_preserves_pool(ops in proptest::collection::vec(op_strategy(), 1..100)) {
        let rt = runtime();
        let result: Result<(), TestCaseError> = rt.block_on(async {
            // /27: 30 usable minus the host address
            let ipam = IpAddressManager::new(pool(27));
            ipam.initialize().await.unwrap();
            let total = ipam.available().await;
            prop_assert_eq!(total, 29);

            for op in &ops {
                match op {
                    Op::Assign(i) => {
                        ipam.assign(&create_mock_interface(&format!("dev-{}", i), "usb0"))
                            .await
                            .unwrap();
                    }
                    Op::Release(i) => {
                        ipam.release(&create_mock_interface(&format!("dev-{}", i), "usb0"))
                            .await;
                    }
                }
                prop_assert_eq!(ipam.available().await + ipam.allocated().await, total);
            }

            let mut live = HashSet::new();
            for i in 0..20 {
                let interface = create_mock_interface(&format!("dev-{}", i), "usb0");
                if let Some(config) = ipam.allocation(&interface).await {
                    prop_assert!(live.insert(config.ip_address));
                }
            }
            Ok(())
        });
        result?;
    }
}
