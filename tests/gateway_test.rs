//! End-to-end gateway scenarios: packet bytes in, packet bytes out.
//!
//! Usage:
//!   cargo test --test gateway_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use amfgate::dispatch::{codes, is_fault, Call, Gateway, Identity, ModuleHandlers, Registry};
use amfgate::error::{ApplicationError, HandlerError, StoreError};
use amfgate::guard::{
    Claim, ClaimTicket, ManualClock, MemoryReplayStore, ReplayGuard, ReplayKey, ReplayStore,
    UnavailablePolicy,
};
use amfgate::protocol::{encode_packet, parse_request, DecodeLimits, Message, Packet, Value};

const START_MS: u64 = 1_700_000_000_000;

/// A tiny shop: one price list, per-user wallets starting at 1000.
struct Shop {
    guard: ReplayGuard,
    prices: HashMap<u32, f64>,
    wallets: Mutex<HashMap<String, f64>>,
    purchases: AtomicUsize,
    /// Lets a test hold a purchase open mid-transaction.
    pause: Option<(Arc<Barrier>, Arc<Barrier>)>,
}

impl Shop {
    fn new(store: Arc<dyn ReplayStore>, clock: Arc<ManualClock>) -> Self {
        Self {
            guard: ReplayGuard::new(store).with_clock(clock),
            prices: HashMap::from([(42, 100.0), (7, 250.0)]),
            wallets: Mutex::new(HashMap::new()),
            purchases: AtomicUsize::new(0),
            pause: None,
        }
    }

    fn balance(&self, user: &str) -> f64 {
        self.wallets.lock().get(user).copied().unwrap_or(1000.0)
    }
}

fn buy(call: &Call<'_>, shop: &Shop) -> Result<Value, HandlerError> {
    let params = call.params()?;
    let merch_id = params.number(0)? as u32;
    let quantity = params.number(1)?;

    shop.guard.run(call, UnavailablePolicy::FailClosed, || {
        if let Some((entered, proceed)) = &shop.pause {
            entered.wait();
            proceed.wait();
        }

        let price = shop.prices.get(&merch_id).copied().ok_or_else(|| {
            ApplicationError::with_code("Shop.UnknownItem", format!("no item {}", merch_id))
        })?;

        let mut wallets = shop.wallets.lock();
        let balance = wallets
            .entry(call.identity().subject().to_owned())
            .or_insert(1000.0);
        let cost = price * quantity;
        if *balance < cost {
            return Err(ApplicationError::with_code("Shop.InsufficientFunds", "not enough coins").into());
        }
        *balance -= cost;
        shop.purchases.fetch_add(1, Ordering::SeqCst);

        Ok(Value::object([
            ("status", Value::from("success")),
            ("wallet", Value::from(*balance)),
        ]))
    })
}

fn shop_gateway(shop: Shop) -> Gateway<Shop> {
    let registry = Registry::builder()
        .register("shop", 0, || {
            ModuleHandlers::new()
                .route("api.shop.buy", buy)
                .alias("api.store.buy", "api.shop.buy")
        })
        .build();
    Gateway::new(registry, shop)
}

fn setup() -> (Gateway<Shop>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    let shop = Shop::new(Arc::new(MemoryReplayStore::new()), Arc::clone(&clock));
    (shop_gateway(shop), clock)
}

fn buy_request(merch_id: u32, quantity: u32) -> Vec<u8> {
    encode_packet(&Packet::request(
        "api.shop.buy",
        "/1",
        vec![Value::from(merch_id), Value::from(quantity)],
    ))
    .unwrap()
}

fn reply_of(body: &[u8]) -> (String, Value) {
    let packet = parse_request(body).unwrap();
    let msg = packet.first_message();
    (
        msg.target_uri.to_owned(),
        msg.decode_body(DecodeLimits::default()).unwrap(),
    )
}

#[test]
fn test_purchase_and_replay_within_ttl() {
    let (gateway, _clock) = setup();
    let alice = Identity::user("alice");
    let request = buy_request(42, 2);

    let first = gateway.handle(&request, &alice);
    assert_eq!(first.status, 200);
    let (target, value) = reply_of(&first.body);
    assert_eq!(target, "/1/onResult");
    assert_eq!(
        value,
        Value::object([("status", Value::from("success")), ("wallet", Value::from(800))])
    );

    let replay = gateway.handle(&request, &alice);
    assert_eq!(replay.body, first.body);
    assert_eq!(gateway.state().balance("alice"), 800.0);
    assert_eq!(gateway.state().purchases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_purchase_applies_again_after_ttl() {
    let (gateway, clock) = setup();
    let alice = Identity::user("alice");
    let request = buy_request(42, 2);

    gateway.handle(&request, &alice);
    clock.advance(Duration::from_secs(29));
    gateway.handle(&request, &alice);
    assert_eq!(gateway.state().balance("alice"), 800.0);

    clock.advance(Duration::from_secs(1));
    let third = gateway.handle(&request, &alice);
    let (_, value) = reply_of(&third.body);
    assert_eq!(value.get("wallet"), Some(&Value::from(600)));
    assert_eq!(gateway.state().purchases.load(Ordering::SeqCst), 2);
}

#[test]
fn test_replay_is_scoped_to_identity_and_target() {
    let (gateway, _clock) = setup();
    let request = buy_request(42, 2);

    gateway.handle(&request, &Identity::user("alice"));
    gateway.handle(&request, &Identity::user("bob"));
    assert_eq!(gateway.state().balance("alice"), 800.0);
    assert_eq!(gateway.state().balance("bob"), 800.0);

    // The alias is a different target URI, so it is not a replay.
    let alias = encode_packet(&Packet::request(
        "api.store.buy",
        "/2",
        vec![Value::from(42), Value::from(2)],
    ))
    .unwrap();
    gateway.handle(&alias, &Identity::user("alice"));
    assert_eq!(gateway.state().balance("alice"), 600.0);
}

#[test]
fn test_business_failure_is_not_cached() {
    let (gateway, _clock) = setup();
    let alice = Identity::user("alice");
    let too_many = buy_request(7, 5);

    let first = gateway.handle(&too_many, &alice);
    assert!(first.is_fault);
    let (target, fault) = reply_of(&first.body);
    assert_eq!(target, "/1/onStatus");
    assert_eq!(fault.get("code").and_then(Value::as_str), Some("Shop.InsufficientFunds"));
    assert_eq!(fault.get("details").and_then(Value::as_str), Some("api.shop.buy"));

    // Still retryable: once funded, the identical bytes execute.
    gateway
        .state()
        .wallets
        .lock()
        .insert("alice".to_owned(), 5000.0);
    let retry = gateway.handle(&too_many, &alice);
    assert!(!retry.is_fault);
    let (_, value) = reply_of(&retry.body);
    assert_eq!(value.get("wallet"), Some(&Value::from(3750)));
    assert_eq!(gateway.state().purchases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_bad_arguments_and_unknown_method() {
    let (gateway, _clock) = setup();
    let alice = Identity::user("alice");

    let bad = encode_packet(&Packet::request("api.shop.buy", "/4", vec![Value::from("42")])).unwrap();
    let (_, fault) = reply_of(&gateway.handle(&bad, &alice).body);
    assert_eq!(fault.get("code").and_then(Value::as_str), Some(codes::BAD_ARGUMENT));

    let missing = encode_packet(&Packet::request("api.shop.refund", "/5", vec![])).unwrap();
    let response = gateway.handle(&missing, &alice);
    assert_eq!(response.status, 200);
    let (target, fault) = reply_of(&response.body);
    assert_eq!(target, "/5/onStatus");
    assert!(is_fault(&fault));
    assert_eq!(fault.get("code").and_then(Value::as_str), Some(codes::METHOD_NOT_FOUND));
}

#[test]
fn test_batched_packet_is_rejected() {
    let (gateway, _clock) = setup();
    let mut packet = Packet::request("api.shop.buy", "/1", vec![Value::from(42), Value::from(1)]);
    packet.messages.push(Message {
        target_uri: "api.shop.buy".into(),
        response_uri: "/2".into(),
        body: Value::StrictArray(vec![Value::from(42), Value::from(1)]),
    });

    let response = gateway.handle(&encode_packet(&packet).unwrap(), &Identity::user("alice"));
    let (target, fault) = reply_of(&response.body);
    assert_eq!(target, "/1/onStatus");
    assert_eq!(fault.get("code").and_then(Value::as_str), Some(codes::UNSUPPORTED_BATCH));
    assert_eq!(gateway.state().purchases.load(Ordering::SeqCst), 0);
}

#[test]
fn test_concurrent_duplicate_is_refused_while_in_flight() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let entered = Arc::new(Barrier::new(2));
    let proceed = Arc::new(Barrier::new(2));
    let mut shop = Shop::new(Arc::new(MemoryReplayStore::new()), clock);
    shop.pause = Some((Arc::clone(&entered), Arc::clone(&proceed)));
    let gateway = shop_gateway(shop);
    let request = buy_request(42, 2);
    let alice = Identity::user("alice");

    thread::scope(|s| {
        let original = s.spawn(|| gateway.handle(&request, &alice));

        entered.wait();
        let duplicate = gateway.handle(&request, &alice);
        let (_, fault) = reply_of(&duplicate.body);
        assert_eq!(fault.get("code").and_then(Value::as_str), Some(codes::REPLAY_IN_FLIGHT));
        proceed.wait();

        let original = original.join().unwrap();
        assert!(!original.is_fault);
    });

    assert_eq!(gateway.state().purchases.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.state().balance("alice"), 800.0);
}

struct UnreachableStore;

impl ReplayStore for UnreachableStore {
    fn lookup(&self, _: &ReplayKey, _: u64) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn claim(&self, _: &ReplayKey, _: u64, _: u64) -> Result<Claim, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn store(&self, _: &ReplayKey, _: &[u8], _: u64) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn complete(&self, _: &ReplayKey, _: ClaimTicket, _: &[u8], _: u64) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn release(&self, _: &ReplayKey, _: ClaimTicket) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn purge_expired(&self, _: u64) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[test]
fn test_unreachable_store_fails_closed() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let gateway = shop_gateway(Shop::new(Arc::new(UnreachableStore), clock));

    let response = gateway.handle(&buy_request(42, 2), &Identity::user("alice"));
    let (_, fault) = reply_of(&response.body);
    assert_eq!(fault.get("code").and_then(Value::as_str), Some(codes::GUARD_UNAVAILABLE));
    assert_eq!(gateway.state().purchases.load(Ordering::SeqCst), 0);
    assert_eq!(gateway.state().balance("alice"), 1000.0);
}

#[test]
fn test_module_override_by_priority() {
    let registry: Registry<()> = Registry::builder()
        .module(
            "a",
            0,
            ModuleHandlers::new().route("api.x", |_: &Call<'_>, _: &()| Ok(Value::from("h1"))),
        )
        .module(
            "b",
            0,
            ModuleHandlers::new().route("api.x", |_: &Call<'_>, _: &()| Ok(Value::from("h2"))),
        )
        .build();
    let gateway = Gateway::new(registry, ());

    let request = encode_packet(&Packet::request("api.x", "/1", vec![])).unwrap();
    let (_, value) = reply_of(&gateway.handle(&request, &Identity::user("u")).body);
    assert_eq!(value, Value::from("h2"));
    assert_eq!(gateway.registry().overrides()[0].shadowed, "a");
}
