//! Property tests for routing and unsubscribe selection.

use command_hub::{
    Caller, CommandId, CommandInput, DeviceId, DeviceSelection, Filter, Hub, MemoryCommandStore,
    SubscriptionId,
};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

const DEVICES: [&str; 4] = ["a", "b", "c", "d"];
const NAMES: [&str; 3] = ["on", "off", "reboot"];

fn filter_strategy() -> impl Strategy<Value = Filter> {
    let devices = prop::sample::subsequence(DEVICES.to_vec(), 1..=DEVICES.len());
    let names = prop::option::of(prop::sample::subsequence(NAMES.to_vec(), 1..=NAMES.len()));
    (any::<bool>(), devices, names).prop_map(|(all, devices, names)| {
        let filter = if all {
            Filter::all_permitted()
        } else {
            Filter::devices(devices).unwrap()
        };
        match names {
            Some(names) => filter.with_names(names).unwrap(),
            None => filter,
        }
    })
}

fn command_strategy() -> impl Strategy<Value = (&'static str, &'static str)> {
    (
        prop::sample::select(DEVICES.to_vec()),
        prop::sample::select(NAMES.to_vec()),
    )
}

fn test_hub() -> Hub {
    Hub::new(Arc::new(MemoryCommandStore::new())).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_matching_equals_filter_predicate(
        filters in prop::collection::vec(filter_strategy(), 0..12),
        commands in prop::collection::vec(command_strategy(), 1..8),
    ) {
        let hub = test_hub();
        let conn = hub.connect();
        let subscribed: Vec<(SubscriptionId, Filter)> = filters
            .into_iter()
            .map(|f| (hub.subscribe_filter(conn.id, f.clone(), None).unwrap(), f))
            .collect();

        for (i, (device, name)) in commands.into_iter().enumerate() {
            let command = CommandInput::new(name)
                .into_command(CommandId(i as i64 + 1), DeviceId::new(device), None);

            let matched: HashSet<_> = hub.registry().matching(&command).into_iter().collect();
            let expected: HashSet<_> = subscribed
                .iter()
                .filter(|(_, f)| f.matches(&command))
                .map(|(id, _)| *id)
                .collect();
            prop_assert_eq!(matched, expected);
        }
    }

    #[test]
    fn prop_delivery_follows_matching(
        filters in prop::collection::vec(filter_strategy(), 1..8),
        (device, name) in command_strategy(),
    ) {
        let hub = test_hub();
        let mut expected = 0;
        let mut handles = Vec::new();
        for f in filters {
            let conn = hub.connect();
            let sample = CommandInput::new(name).into_command(CommandId(0), DeviceId::new(device), None);
            if f.matches(&sample) {
                expected += 1;
            }
            hub.subscribe_filter(conn.id, f, None).unwrap();
            handles.push(conn);
        }

        hub.insert_command(None, &DeviceId::new(device), CommandInput::new(name), &Caller::user(1))
            .unwrap();
        let delivered: usize = handles.iter().map(|h| h.drain().len()).sum();
        prop_assert_eq!(delivered, expected);
    }

    #[test]
    fn prop_unsubscribe_by_guids_removes_exactly_intersecting(
        filters in prop::collection::vec(filter_strategy(), 0..10),
        guids in prop::sample::subsequence(DEVICES.to_vec(), 1..=DEVICES.len()),
    ) {
        let hub = test_hub();
        let conn = hub.connect();
        let selection = DeviceSelection::from_guids(guids.iter().copied());
        let mut expected = BTreeSet::new();
        for f in filters {
            let hits = f.scope().intersects(&selection);
            let id = hub.subscribe_filter(conn.id, f, None).unwrap();
            if hits {
                expected.insert(id.to_string());
            }
        }

        let removed: BTreeSet<_> = hub
            .unsubscribe(conn.id, None, Some(selection))
            .unwrap()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        prop_assert_eq!(removed, expected);
    }
}
