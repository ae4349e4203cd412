use dpsync_agent::Agent;
use dpsync_core::ObjectState;
use dpsync_descriptors::binapi::InterfaceCreate;
use dpsync_descriptors::SimDevice;
use dpsync_device::Connection;
use dpsync_models::{interface_key, BridgeDomain, ConfigItem, EndFunction, Interface, LocalSid, Route, TmcConfig};
use dpsync_reconcile::CascadePolicy;

fn agent(policy: CascadePolicy) -> (Agent, SimDevice) {
    let dev = SimDevice::new();
    let agent = Agent::with_device(&dev, policy).unwrap();
    (agent, dev)
}

fn disabled(name: &str) -> Interface {
    let mut i = Interface::memif(name, 1);
    i.enabled = false;
    i
}

#[test]
fn route_waits_for_interface_and_is_unwound_before_it() {
    let (agent, dev) = agent(CascadePolicy::default());
    let route = Route::new("10.1.0.0/24", "10.0.0.2").via("X");
    let rkey = route.key();
    let xkey = interface_key("X");

    let r = agent.put(route.into()).unwrap();
    assert_eq!(r.device_calls(), 0);
    assert!(dev.calls().is_empty());
    assert_eq!(agent.lookup_index(&xkey), None);
    assert_eq!(agent.state(&rkey), ObjectState::Pending);

    let r = agent.put(disabled("X").into()).unwrap();
    assert!(r.is_ok());
    assert_eq!(dev.call_names(), vec!["interface_create", "ip_route_add_del"]);
    assert!(agent.lookup_index(&xkey).is_some());
    assert_eq!(agent.state(&rkey), ObjectState::Realized);

    dev.clear_calls();
    let r = agent.delete(&xkey).unwrap();
    assert!(r.is_ok());
    assert_eq!(dev.call_names(), vec!["ip_route_add_del", "interface_delete"]);
    assert_eq!(agent.lookup_index(&xkey), None);
    assert_eq!(agent.lookup_index(&rkey), None);
    assert_eq!(agent.state(&rkey), ObjectState::Absent);
    assert_eq!(dev.route_count(), 0);
    assert_eq!(dev.integrity_violations(), 0);
}

#[test]
fn requeued_dependents_return_with_their_prerequisite() {
    let (agent, dev) = agent(CascadePolicy::Requeue);
    agent.put(disabled("memif1").into()).unwrap();
    agent.put(TmcConfig::new("cfg1", "memif1", 1400).into()).unwrap();
    agent.delete(&interface_key("memif1")).unwrap();
    assert_eq!(agent.state("config/vpp/v2/tmc/memif1"), ObjectState::Pending);

    agent.put(disabled("memif1").into()).unwrap();
    assert_eq!(agent.state("config/vpp/v2/tmc/memif1"), ObjectState::Realized);
    let idx = dev.sw_if_index_of("memif1").unwrap();
    assert_eq!(dev.tmc_mss(idx), Some(1400));
}

#[test]
fn drop_policy_forgets_dependents() {
    let (agent, dev) = agent(CascadePolicy::Drop);
    agent.put(disabled("memif1").into()).unwrap();
    agent.put(TmcConfig::new("cfg1", "memif1", 1400).into()).unwrap();
    agent.delete(&interface_key("memif1")).unwrap();
    assert_eq!(agent.state("config/vpp/v2/tmc/memif1"), ObjectState::Absent);

    agent.put(disabled("memif1").into()).unwrap();
    assert_eq!(agent.state("config/vpp/v2/tmc/memif1"), ObjectState::Absent);
    assert_eq!(dev.count("tmc_enable_disable"), 2);
}

#[test]
fn equivalent_put_is_idempotent() {
    let (agent, dev) = agent(CascadePolicy::Requeue);
    agent.put(Interface::loopback("loop0").with_address("10.0.0.1/24").into()).unwrap();
    let before = dev.calls().len();
    let r = agent.put(Interface::loopback(" loop0").with_address("10.0.0.1/24").into()).unwrap();
    assert!(r.transitions.is_empty());
    assert_eq!(dev.calls().len(), before);
}

#[test]
fn replacing_an_interface_unwinds_and_restores_dependents() {
    let (agent, dev) = agent(CascadePolicy::Requeue);
    agent.put(disabled("memif1").into()).unwrap();
    agent.put(Route::new("10.1.0.0/24", "10.0.0.2").via("memif1").into()).unwrap();
    let mut changed = disabled("memif1");
    changed.mtu = Some(1500);
    agent.put(changed.into()).unwrap();

    let names = dev.call_names();
    let tail: Vec<&str> = names[names.len() - 5..].to_vec();
    assert_eq!(tail, vec!["ip_route_add_del", "interface_delete", "interface_create", "sw_interface_set_mtu", "ip_route_add_del"]);
    assert_eq!(dev.route_count(), 1);
    assert_eq!(dev.integrity_violations(), 0);
}

#[test]
fn modify_rejects_missing_sides() {
    let (agent, _dev) = agent(CascadePolicy::Requeue);
    let item: ConfigItem = Interface::loopback("loop0").into();
    assert!(agent.modify(None, Some(item.clone())).is_err());
    assert!(agent.modify(Some(item), None).is_err());
}

#[test]
fn modify_moves_tmc_between_interfaces() {
    let (agent, dev) = agent(CascadePolicy::Requeue);
    agent.put(disabled("a").into()).unwrap();
    agent.put(disabled("b").into()).unwrap();
    let old: ConfigItem = TmcConfig::new("cfg", "a", 1400).into();
    agent.put(old.clone()).unwrap();
    agent.modify(Some(old), Some(TmcConfig::new("cfg", "b", 1400).into())).unwrap();
    assert_eq!(dev.tmc_mss(dev.sw_if_index_of("a").unwrap()), None);
    assert_eq!(dev.tmc_mss(dev.sw_if_index_of("b").unwrap()), Some(1400));
}

fn snapshot() -> Vec<ConfigItem> {
    vec![
        disabled("memif1").into(),
        Interface::loopback("loop0").into(),
        Route::new("10.1.0.0/24", "10.0.0.2").via("memif1").into(),
        BridgeDomain::new("bd1").with_interface("memif1", false).with_interface("loop0", true).into(),
        TmcConfig::new("cfg1", "memif1", 1400).into(),
        LocalSid::new(
            "a::1",
            EndFunction::EndAd { service_address: "10.0.0.9".into(), outgoing_interface: "memif1".into(), incoming_interface: "loop0".into() },
        )
        .into(),
    ]
}

#[test]
fn resync_is_order_insensitive() {
    let (fwd, dev_f) = agent(CascadePolicy::Requeue);
    let (rev, dev_r) = agent(CascadePolicy::Requeue);
    let items = snapshot();
    let mut reversed = items.clone();
    reversed.reverse();

    assert!(fwd.resync(items.clone()).is_ok());
    assert!(rev.resync(reversed).is_ok());
    for item in &items {
        assert_eq!(fwd.state(&item.key()), ObjectState::Realized, "{}", item.key());
        assert_eq!(rev.state(&item.key()), ObjectState::Realized, "{}", item.key());
    }
    assert_eq!(dev_f.local_sid_count(), 1);
    assert_eq!(dev_r.bridge_domain_count(), 1);

    let before = dev_f.calls().len();
    let r = fwd.resync(items);
    assert!(r.transitions.is_empty());
    assert_eq!(dev_f.calls().len(), before);
}

#[test]
fn resync_removes_what_is_no_longer_desired() {
    let (agent, dev) = agent(CascadePolicy::Requeue);
    agent.resync(snapshot());
    let keep: Vec<ConfigItem> = vec![Interface::loopback("loop0").into()];
    let r = agent.resync(keep);
    assert!(r.is_ok(), "{:?}", r.errors);
    assert_eq!(dev.interface_count(), 1);
    assert_eq!(dev.route_count(), 0);
    assert_eq!(dev.local_sid_count(), 0);
    assert_eq!(dev.bridge_domain_count(), 0);
    assert_eq!(dev.integrity_violations(), 0);
}

#[test]
fn external_interface_unblocks_pending_route() {
    let (agent, dev) = agent(CascadePolicy::Requeue);
    let route = Route::new("10.9.0.0/16", "10.0.0.1").via("host0");
    agent.put(route.clone().into()).unwrap();
    assert_eq!(agent.state(&route.key()), ObjectState::Pending);

    let mut ch = dev.new_channel().unwrap();
    let reply = ch
        .send_request(&InterfaceCreate {
            name: "host0".into(),
            if_type: "tap".into(),
            memif_id: 0,
            memif_master: false,
            socket_filename: String::new(),
            host_if_name: String::new(),
        })
        .unwrap();
    let r = agent.notify_realized(&interface_key("host0"), Some(reply.sw_if_index)).unwrap();
    assert_eq!(r.ended_in(ObjectState::Realized), vec![route.key()]);
    assert_eq!(dev.route_count(), 1);

    agent.notify_removed(&interface_key("host0"));
    assert_eq!(agent.state(&route.key()), ObjectState::Pending);
    assert_eq!(dev.route_count(), 0);
}

#[test]
fn failed_create_is_reported_and_retried_on_next_put() {
    let (agent, dev) = agent(CascadePolicy::Requeue);
    dev.fail_next("interface_create", -1);
    let e = agent.put(Interface::loopback("loop0").into()).unwrap_err();
    assert!(e.to_string().contains("interface_create returned -1"), "{}", e);
    assert_eq!(agent.state(&interface_key("loop0")), ObjectState::Absent);
    agent.put(Interface::loopback("loop0").into()).unwrap();
    assert_eq!(agent.state(&interface_key("loop0")), ObjectState::Realized);
}

#[test]
fn reset_forgets_everything_without_device_calls() {
    let (agent, dev) = agent(CascadePolicy::Requeue);
    agent.resync(snapshot());
    let before = dev.calls().len();
    dev.restart();
    agent.reset();
    assert_eq!(dev.calls().len(), before);
    assert_eq!(agent.state(&interface_key("memif1")), ObjectState::Absent);
    assert!(agent.resync(snapshot()).is_ok());
    assert_eq!(dev.interface_count(), 2);
}

#[test]
fn refused_dependent_removal_keeps_the_interface() {
    let (agent, dev) = agent(CascadePolicy::default());
    let route = Route::new("10.1.0.0/24", "10.0.0.2").via("X");
    agent.put(disabled("X").into()).unwrap();
    agent.put(route.clone().into()).unwrap();

    dev.fail_next("ip_route_add_del", -1);
    let e = agent.delete(&interface_key("X")).unwrap_err();
    assert_eq!(e.key(), route.key());
    assert!(e.to_string().contains("ip_route_add_del returned -1"), "{}", e);
    assert_eq!(agent.state(&interface_key("X")), ObjectState::Realized);
    assert_eq!(agent.state(&route.key()), ObjectState::Realized);
    assert_eq!(dev.count("interface_delete"), 0);
    assert_eq!(dev.interface_count(), 1);
    assert_eq!(dev.route_count(), 1);
    assert_eq!(dev.integrity_violations(), 0);

    let r = agent.delete(&interface_key("X")).unwrap();
    assert!(r.is_ok());
    assert_eq!(agent.state(&route.key()), ObjectState::Absent);
    assert_eq!(dev.interface_count(), 0);
    assert_eq!(dev.integrity_violations(), 0);
}

#[test]
fn refused_dependent_removal_blocks_replacement() {
    let (agent, dev) = agent(CascadePolicy::default());
    let route = Route::new("10.1.0.0/24", "10.0.0.2").via("X");
    agent.put(disabled("X").into()).unwrap();
    agent.put(route.clone().into()).unwrap();

    dev.fail_next("ip_route_add_del", -1);
    let mut changed = disabled("X");
    changed.mtu = Some(1500);
    assert!(agent.put(changed.into()).is_err());
    assert_eq!(dev.count("interface_delete"), 0);
    match agent.item(&interface_key("X")) {
        Some(ConfigItem::Interface(i)) => assert_eq!(i.mtu, None),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(agent.state(&route.key()), ObjectState::Realized);
    assert_eq!(dev.integrity_violations(), 0);
}

#[test]
fn refused_recreate_keeps_the_new_value_for_retry() {
    let (agent, dev) = agent(CascadePolicy::default());
    let route = Route::new("10.1.0.0/24", "10.0.0.2").via("X");
    agent.put(disabled("X").into()).unwrap();
    agent.put(route.clone().into()).unwrap();

    dev.fail_next("interface_create", -1);
    let mut changed = disabled("X");
    changed.mtu = Some(1500);
    assert!(agent.put(changed.clone().into()).is_err());
    assert_eq!(agent.state(&interface_key("X")), ObjectState::Pending);
    match agent.item(&interface_key("X")) {
        Some(ConfigItem::Interface(i)) => assert_eq!(i.mtu, Some(1500)),
        other => panic!("unexpected {:?}", other),
    }
    // Replacement requeues dependents even under the drop policy.
    assert_eq!(agent.state(&route.key()), ObjectState::Pending);

    agent.put(changed.into()).unwrap();
    assert_eq!(agent.state(&interface_key("X")), ObjectState::Realized);
    assert_eq!(agent.state(&route.key()), ObjectState::Realized);
    let idx = dev.sw_if_index_of("X").unwrap();
    assert_eq!(dev.interface_mtu(idx), Some(1500));
    assert_eq!(dev.route_count(), 1);
}

#[test]
fn removing_an_interface_deletes_all_its_routes() {
    let (agent, dev) = agent(CascadePolicy::default());
    agent.put(disabled("X").into()).unwrap();
    let routes = [
        Route::new("10.1.0.0/24", "10.0.0.2").via("X"),
        Route::new("10.2.0.0/24", "10.0.0.3").via("X"),
        Route::new("10.3.0.0/24", "10.0.0.4").via("X"),
    ];
    for r in &routes {
        agent.put(r.clone().into()).unwrap();
    }
    assert_eq!(dev.route_count(), 3);

    let r = agent.delete(&interface_key("X")).unwrap();
    assert_eq!(r.ended_in(ObjectState::Absent).len(), 4);
    for route in &routes {
        assert_eq!(agent.state(&route.key()), ObjectState::Absent);
    }
    assert_eq!(dev.route_count(), 0);
    assert_eq!(dev.integrity_violations(), 0);
}
