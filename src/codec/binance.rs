//! Binance USDⓈ-M futures stream payloads
//!
//! Handles combined-stream envelopes (`{"stream": .., "data": ..}`) as well
//! as bare messages. Event types the engine does not consume decode to an
//! empty list.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::EngineError;
use crate::models::{
    KlineUpdate, MarkPriceUpdate, MarketEvent, OrderStatus, OrderType, OrderUpdate, Side,
};

#[derive(Debug, Deserialize)]
struct KlineMessage {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlineBody,
}

#[derive(Debug, Deserialize)]
struct KlineBody {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[derive(Debug, Deserialize)]
struct MarkPriceMessage {
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderTradeUpdate {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "o")]
    order: OrderBody,
}

#[derive(Debug, Deserialize)]
struct OrderBody {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    order_id: u64,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "S")]
    side: Side,
    #[serde(rename = "z")]
    filled_qty: Decimal,
    #[serde(rename = "ap")]
    avg_price: Decimal,
    #[serde(rename = "R", default)]
    reduce_only: bool,
    #[serde(rename = "ot")]
    order_type: OrderType,
}

/// Decode one raw stream message into zero or more market events
pub fn decode(payload: &str) -> Result<Vec<MarketEvent>, EngineError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| EngineError::validation("payload", e.to_string()))?;

    let data = match value {
        Value::Object(mut envelope) if envelope.contains_key("stream") => envelope
            .remove("data")
            .ok_or_else(|| EngineError::validation("payload", "combined stream without data"))?,
        other => other,
    };

    if let Value::Array(items) = data {
        return decode_mark_prices(items).map(|updates| vec![MarketEvent::MarkPrice(updates)]);
    }

    let event_type = data
        .get("e")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| EngineError::validation("payload", "missing event type"))?;

    match event_type.as_str() {
        "kline" => decode_kline(data).map(|kline| vec![MarketEvent::Kline(kline)]),
        "markPriceUpdate" => {
            decode_mark_prices(vec![data]).map(|updates| vec![MarketEvent::MarkPrice(updates)])
        }
        "ORDER_TRADE_UPDATE" => {
            decode_order(data).map(|order| order.map(MarketEvent::Order).into_iter().collect())
        }
        other => {
            tracing::trace!(event = other, "Ignoring stream event");
            Ok(Vec::new())
        }
    }
}

fn parse<T: DeserializeOwned>(kind: &'static str, value: Value) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| EngineError::validation(kind, e.to_string()))
}

fn timestamp(kind: &'static str, millis: i64) -> Result<DateTime<Utc>, EngineError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| EngineError::validation(kind, format!("timestamp {} out of range", millis)))
}

fn decode_kline(value: Value) -> Result<KlineUpdate, EngineError> {
    let message: KlineMessage = parse("kline", value)?;
    let k = message.kline;

    Ok(KlineUpdate {
        symbol: message.symbol,
        open: k.open,
        high: k.high,
        low: k.low,
        close: k.close,
        is_closed: k.is_closed,
        open_time: timestamp("kline", k.open_time)?,
        event_time: timestamp("kline", message.event_time)?,
    })
}

fn decode_mark_prices(items: Vec<Value>) -> Result<Vec<MarkPriceUpdate>, EngineError> {
    items
        .into_iter()
        .map(|item| {
            let message: MarkPriceMessage = parse("mark_price", item)?;
            let event_time = match message.event_time {
                Some(millis) => timestamp("mark_price", millis)?,
                None => Utc::now(),
            };
            Ok(MarkPriceUpdate {
                symbol: message.symbol,
                mark_price: message.mark_price,
                event_time,
            })
        })
        .collect()
}

fn order_status(raw: &str) -> Option<OrderStatus> {
    match raw {
        "NEW" => Some(OrderStatus::New),
        "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
        "FILLED" => Some(OrderStatus::Filled),
        "CANCELED" => Some(OrderStatus::Canceled),
        "REJECTED" => Some(OrderStatus::Rejected),
        "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Expired),
        _ => None,
    }
}

fn decode_order(value: Value) -> Result<Option<OrderUpdate>, EngineError> {
    let message: OrderTradeUpdate = parse("order", value)?;
    let o = message.order;

    let Some(status) = order_status(&o.status) else {
        tracing::debug!(symbol = %o.symbol, status = %o.status, "Ignoring order status");
        return Ok(None);
    };

    Ok(Some(OrderUpdate {
        symbol: o.symbol,
        order_id: o.order_id,
        status,
        side: o.side,
        filled_qty: o.filled_qty,
        avg_price: o.avg_price,
        reduce_only: o.reduce_only,
        order_type: o.order_type,
        event_time: timestamp("order", message.event_time)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const KLINE: &str = r#"{"stream":"solusdt@kline_5m","data":{"e":"kline","E":1704067260000,"s":"SOLUSDT","k":{"t":1704067200000,"T":1704067499999,"s":"SOLUSDT","i":"5m","o":"100.00","c":"96.80","h":"100.00","l":"96.10","v":"1000","n":12,"x":false,"q":"1","V":"1","Q":"1","B":"0"}}}"#;

    #[test]
    fn test_decode_kline() {
        let events = decode(KLINE).unwrap();
        match &events[..] {
            [MarketEvent::Kline(k)] => {
                assert_eq!(k.symbol, "SOLUSDT");
                assert_eq!(k.open, dec!(100));
                assert_eq!(k.low, dec!(96.1));
                assert_eq!(k.close, dec!(96.8));
                assert!(!k.is_closed);
                assert_eq!(k.open_time.timestamp_millis(), 1704067200000);
                assert_eq!(k.event_time.timestamp_millis(), 1704067260000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_mark_price_array() {
        let payload = r#"{"stream":"!markPrice@arr","data":[{"e":"markPriceUpdate","E":1704067260000,"s":"SOLUSDT","p":"101.25","r":"0.0001","T":1704096000000},{"e":"markPriceUpdate","E":1704067260000,"s":"BTCUSDT","p":"42000.1","r":"0.0001","T":1704096000000}]}"#;
        let events = decode(payload).unwrap();
        match &events[..] {
            [MarketEvent::MarkPrice(updates)] => {
                assert_eq!(updates.len(), 2);
                assert_eq!(updates[0].symbol, "SOLUSDT");
                assert_eq!(updates[0].mark_price, dec!(101.25));
                assert_eq!(updates[1].mark_price, dec!(42000.1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_bare_mark_array() {
        let events = decode(r#"[{"s":"SOLUSDT","p":"99.5"}]"#).unwrap();
        assert!(matches!(&events[..], [MarketEvent::MarkPrice(u)] if u[0].mark_price == dec!(99.5)));
    }

    #[test]
    fn test_decode_order_trade_update() {
        let payload = r#"{"e":"ORDER_TRADE_UPDATE","E":1704067300000,"T":1704067300000,"o":{"s":"SOLUSDT","c":"x","S":"BUY","o":"LIMIT","f":"GTC","q":"0.1","p":"96.75","ap":"96.75","sp":"0","x":"TRADE","X":"FILLED","i":8886774,"l":"0.1","z":"0.1","L":"96.75","T":1704067300000,"R":false,"ot":"LIMIT","ps":"BOTH"}}"#;
        let events = decode(payload).unwrap();
        match &events[..] {
            [MarketEvent::Order(o)] => {
                assert_eq!(o.order_id, 8886774);
                assert_eq!(o.status, OrderStatus::Filled);
                assert_eq!(o.side, Side::Buy);
                assert_eq!(o.filled_qty, dec!(0.1));
                assert_eq!(o.avg_price, dec!(96.75));
                assert!(!o.reduce_only);
                assert_eq!(o.order_type, OrderType::Limit);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_order_type_and_status() {
        let trailing = r#"{"e":"ORDER_TRADE_UPDATE","E":1,"o":{"s":"SOLUSDT","i":1,"X":"NEW","S":"SELL","z":"0","ap":"0","R":true,"ot":"TRAILING_STOP_MARKET"}}"#;
        match &decode(trailing).unwrap()[..] {
            [MarketEvent::Order(o)] => assert_eq!(o.order_type, OrderType::Other),
            other => panic!("unexpected {:?}", other),
        }

        let adl = r#"{"e":"ORDER_TRADE_UPDATE","E":1,"o":{"s":"SOLUSDT","i":1,"X":"NEW_ADL","S":"SELL","z":"0","ap":"0","R":true,"ot":"MARKET"}}"#;
        assert!(decode(adl).unwrap().is_empty());
    }

    #[test]
    fn test_ignored_and_malformed() {
        assert!(decode(r#"{"e":"ACCOUNT_UPDATE","E":1}"#).unwrap().is_empty());

        for bad in [
            "{",
            r#"{"E":1}"#,
            r#"{"e":"kline","E":1,"s":"SOLUSDT","k":{"t":1,"o":"abc","h":"1","l":"1","c":"1","x":true}}"#,
            r#"{"stream":"x"}"#,
            "42",
        ] {
            assert!(
                matches!(decode(bad), Err(EngineError::Validation { .. })),
                "accepted {}",
                bad
            );
        }
    }
}
