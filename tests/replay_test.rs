use klinebot::codec;
use klinebot::engine::{DecisionEngine, EngineEvent};
use klinebot::execution::LifecycleState;
use klinebot::models::{ExecutionCommand, Side};
use klinebot::EngineConfig;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const T0: i64 = 1_704_067_200_000;

fn kline_line(minute: i64, open: Decimal, close: Decimal, closed: bool) -> String {
    let open_time = T0 + minute * 300_000;
    format!(
        r#"{{"e":"kline","E":{},"s":"SOLUSDT","k":{{"t":{},"o":"{}","h":"{}","l":"{}","c":"{}","x":{}}}}}"#,
        open_time + if closed { 299_999 } else { 60_000 },
        open_time,
        open,
        open.max(close),
        open.min(close),
        close,
        closed
    )
}

/// Small red candles: -0.5% each, far below any tier threshold
fn falling(minutes: std::ops::Range<i64>) -> Vec<String> {
    minutes
        .map(|m| {
            let open = dec!(100) - Decimal::from(m);
            kline_line(m, open, open - dec!(0.5), true)
        })
        .collect()
}

fn replay(engine: &mut DecisionEngine, lines: &[String]) -> Vec<ExecutionCommand> {
    let mut commands = Vec::new();
    for line in lines {
        for event in codec::decode(line).unwrap() {
            commands.extend(engine.handle_event(EngineEvent::Market(event)).unwrap());
        }
    }
    commands
}

fn entries(commands: &[ExecutionCommand]) -> Vec<(Side, Decimal)> {
    commands
        .iter()
        .filter_map(|c| match c {
            ExecutionCommand::SubmitEntry { side, price, .. } => Some((*side, *price)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_oversold_pattern_waits_for_rsi_history() {
    let mut engine = DecisionEngine::new(&EngineConfig::default());

    // three reds are there from the third candle, RSI(6) needs seven closes
    let early = replay(&mut engine, &falling(0..6));
    assert!(early.is_empty());
    assert!(engine.windows().rsi("SOLUSDT").is_none());

    let commands = replay(&mut engine, &falling(6..7));
    assert_eq!(entries(&commands), vec![(Side::Buy, dec!(93.5) * dec!(0.9995))]);
    assert_eq!(engine.ledger().state("SOLUSDT"), LifecycleState::PendingEntry);

    // the reservation holds while the entry is unconfirmed
    let later = replay(&mut engine, &falling(7..9));
    assert!(entries(&later).is_empty());
}

#[test]
fn test_seeded_history_allows_immediate_pattern() {
    let mut engine = DecisionEngine::new(&EngineConfig::default());
    let seed: Vec<Decimal> = (0..10).map(|i| dec!(120) - Decimal::from(i * 2)).collect();
    engine.seed_history("SOLUSDT", &seed);
    assert_eq!(engine.windows().symbol_info("SOLUSDT").candle_count, 0);

    let commands = replay(&mut engine, &falling(0..3));
    assert_eq!(entries(&commands).len(), 1);
}

#[test]
fn test_intra_bucket_updates_replace_the_candle() {
    let mut engine = DecisionEngine::new(&EngineConfig::default());
    let lines = vec![
        kline_line(0, dec!(100), dec!(99.9), false),
        kline_line(0, dec!(100), dec!(99.7), false),
        kline_line(0, dec!(100), dec!(99.5), true),
        kline_line(1, dec!(99.5), dec!(99.4), false),
    ];
    replay(&mut engine, &lines);

    let info = engine.windows().symbol_info("SOLUSDT");
    assert_eq!(info.candle_count, 2);
    assert_eq!(info.total_count, 4);
    assert_eq!(
        engine.windows().close_history("SOLUSDT"),
        vec![dec!(99.5), dec!(99.4)]
    );
}

#[test]
fn test_exit_on_bucket_close_after_fill() {
    let mut engine = DecisionEngine::new(&EngineConfig::default());
    let commands = replay(&mut engine, &falling(0..7));
    let (side, price) = entries(&commands)[0];

    let fill = format!(
        r#"{{"e":"ORDER_TRADE_UPDATE","E":{},"o":{{"s":"SOLUSDT","i":1,"X":"FILLED","S":"{}","z":"0.1","ap":"{}","R":false,"ot":"LIMIT"}}}}"#,
        T0 + 7 * 300_000,
        side,
        price
    );
    let commands = replay(&mut engine, &[fill]);
    assert!(matches!(
        &commands[..],
        [ExecutionCommand::SubmitProtective { side: Side::Sell, .. }]
    ));

    // next bucket still open: no exit yet
    let open_update = kline_line(7, dec!(93), dec!(93.2), false);
    assert!(replay(&mut engine, &[open_update]).is_empty());

    let closed = kline_line(7, dec!(93), dec!(93.4), true);
    let commands = replay(&mut engine, &[closed]);
    assert_eq!(
        commands,
        vec![
            ExecutionCommand::ClosePosition {
                symbol: "SOLUSDT".to_string()
            },
            ExecutionCommand::CancelAll {
                symbol: "SOLUSDT".to_string()
            },
        ]
    );
    assert_eq!(engine.ledger().state("SOLUSDT"), LifecycleState::PendingExit);
}
