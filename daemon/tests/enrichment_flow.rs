// Cross-module flows of the enrichment pipeline, exercised without a
// database or live RPC

use hydrascan_common::{network::Network, tags::AddressTag};
use hydrascan_daemon::{
    batch::{chunk_operation, BatchError},
    optimizer::{ChunkOptimizer, ChunkOutcome, Operation},
    scanner::extract_participants,
    storage::{merge_into, AddressRecord, AddressUpsert},
};
use serde_json::json;

fn transfer_log(from: &str, to: &str, block: u64) -> hydrascan_common::api::rpc::RpcLog {
    serde_json::from_value(json!({
        "address": "0xdac17f958d2ee523a2206206994597c13d831ec7",
        "topics": [
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef",
            format!("0x000000000000000000000000{}", from),
            format!("0x000000000000000000000000{}", to),
        ],
        "data": "0x",
        "blockNumber": format!("{:#x}", block),
        "logIndex": "0x0",
    }))
    .unwrap()
}

// Discovery, classification and a fund refresh applied in sequence
// must each enrich the row without erasing earlier stages
#[test]
fn test_lifecycle_upserts_compose() {
    let logs = vec![transfer_log(
        "00000000000000000000000000000000000000a1",
        "00000000000000000000000000000000000000b2",
        1_000,
    )];
    let participants = extract_participants(&logs);
    assert_eq!(participants.len(), 2);

    // discovery
    let discovered =
        AddressUpsert::discovered(&participants[0].0, "ethereum", 1_700_000_000).unwrap();
    let mut row = AddressRecord {
        address: discovered.address.clone(),
        network: discovered.network.clone(),
        first_seen: discovered.first_seen,
        last_updated: discovered.last_updated,
        code_hash: None,
        contract_name: None,
        deployed: None,
        tags: None,
        fund: None,
        last_fund_updated: None,
        name_checked: None,
        name_checked_at: None,
    };
    assert!(!row.is_classified());

    // classification attaches the tag and code hash
    let classify = AddressUpsert {
        address: row.address.clone(),
        network: row.network.clone(),
        first_seen: row.first_seen,
        last_updated: 1_700_000_100,
        code_hash: Some("0xfeed".to_string()),
        ..Default::default()
    }
    .with_tags(vec![AddressTag::Contract]);
    row = merge_into(&row, &classify);
    assert!(row.has_tag(&AddressTag::Contract));

    // deployment resolution fills deployed only
    let deployment = AddressUpsert {
        address: row.address.clone(),
        network: row.network.clone(),
        first_seen: row.first_seen,
        last_updated: 1_700_000_200,
        deployed: Some(1_511_266_584),
        ..Default::default()
    };
    row = merge_into(&row, &deployment);

    // a later fund refresh carries no classification data and must
    // leave it untouched
    let fund = AddressUpsert {
        address: row.address.clone(),
        network: row.network.clone(),
        first_seen: row.first_seen,
        last_updated: 1_700_000_300,
        fund: Some(650_000),
        last_fund_updated: Some(1_700_000_300),
        ..Default::default()
    };
    row = merge_into(&row, &fund);

    assert!(row.has_tag(&AddressTag::Contract));
    assert_eq!(row.code_hash.as_deref(), Some("0xfeed"));
    assert_eq!(row.deployed, Some(1_511_266_584));
    assert_eq!(row.fund, Some(650_000));
    assert_eq!(row.first_seen, 1_700_000_000);
    assert_eq!(row.last_updated, 1_700_000_300);
}

// The batching loop feeds the optimizer; a longer session must end up
// confident enough to recommend a learned start size
#[tokio::test]
async fn test_chunk_sessions_learn_across_runs() {
    let optimizer = ChunkOptimizer::new(Network::Ethereum, Operation::NativeBalance, None);
    let items: Vec<u64> = (0..20_000).collect();

    let result = chunk_operation(&optimizer, &items, 1, 0u64, |chunk| async move {
        Ok::<_, BatchError>(chunk)
    })
    .await
    .unwrap();
    assert_eq!(result.len(), items.len());

    // replaying the recorded snapshot into a fresh optimizer is the
    // persistence round trip the daemon does between runs
    let snapshot = optimizer.snapshot();
    let restored = ChunkOptimizer::new(
        Network::Ethereum,
        Operation::NativeBalance,
        Some(snapshot.clone()),
    );
    assert_eq!(restored.snapshot(), snapshot);
}

// A cold optimizer plus recorded outcomes must produce the same start
// params as one restored from the persisted state
#[test]
fn test_start_params_survive_roundtrip() {
    let optimizer = ChunkOptimizer::new(Network::Base, Operation::Erc20, None);
    for _ in 0..300 {
        optimizer.record(ChunkOutcome {
            chunk_size: 250,
            duration_ms: 1_500,
            success: true,
            is_socket_error: false,
        });
    }

    let restored =
        ChunkOptimizer::new(Network::Base, Operation::Erc20, Some(optimizer.snapshot()));
    assert_eq!(restored.start_params(), optimizer.start_params());
    assert_eq!(restored.start_params().initial, 250);
}
