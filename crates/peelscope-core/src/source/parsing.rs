//! Translation of Bitcoin Core style verbose transaction JSON into
//! [`ResolvedTransaction`].
//!
//! Both `getrawtransaction <txid> 1` and Electrum's verbose
//! `blockchain.transaction.get` return this shape, so the local node and
//! the Electrum source share these helpers.

use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Txid};

use crate::error::CoreError;
use crate::types::{BlockHeight, ResolvedInput, ResolvedOutput, ResolvedTransaction};

/// Parse a verbose transaction object.
///
/// `blockheight` is read when present; callers that need a height for a
/// confirmed transaction without one look it up from `block_hash`.
pub(crate) fn parse_verbose_transaction(
    raw: &serde_json::Value,
) -> Result<ResolvedTransaction, CoreError> {
    let txid = parse_txid(raw.get("txid"), "txid")?;
    let block_hash = parse_opt_block_hash(raw.get("blockhash"))?;
    let block_height =
        parse_integer_optional::<u32, false>(raw.get("blockheight")).map(BlockHeight);
    let observed_time = parse_integer_optional::<u64, false>(raw.get("blocktime"))
        .or_else(|| parse_integer_optional::<u64, false>(raw.get("time")));

    let vin = raw
        .get("vin")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| CoreError::InvalidTxData("missing vin array".into()))?;
    let vout = raw
        .get("vout")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| CoreError::InvalidTxData("missing vout array".into()))?;

    Ok(ResolvedTransaction {
        txid,
        observed_time,
        block_hash,
        block_height,
        input_value_total: None,
        inputs: parse_vin(vin)?,
        outputs: parse_vout(vout)?,
    })
}

/// Whether the verbose transaction reports at least one confirmation.
pub(crate) fn is_confirmed(raw: &serde_json::Value) -> bool {
    parse_integer_optional::<u64, false>(raw.get("confirmations")).unwrap_or(0) > 0
}

pub(crate) fn parse_txid(
    value: Option<&serde_json::Value>,
    field: &str,
) -> Result<Txid, CoreError> {
    let value = value
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| CoreError::InvalidTxData(format!("missing {field}")))?;
    value
        .parse()
        .map_err(|e| CoreError::InvalidTxData(format!("invalid {field}: {e}")))
}

pub(crate) fn parse_opt_block_hash(
    value: Option<&serde_json::Value>,
) -> Result<Option<BlockHash>, CoreError> {
    match value.and_then(serde_json::Value::as_str) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| CoreError::InvalidTxData(format!("invalid blockhash: {e}"))),
    }
}

pub(crate) fn parse_integer_required<T, const SIGNED: bool>(
    value: Option<&serde_json::Value>,
    field: &str,
) -> Result<T, CoreError>
where
    T: TryFrom<i64> + TryFrom<u64>,
{
    parse_integer::<T, SIGNED, true>(value, field)?
        .ok_or_else(|| CoreError::InvalidTxData(format!("missing {field}")))
}

pub(crate) fn parse_integer_optional<T, const SIGNED: bool>(
    value: Option<&serde_json::Value>,
) -> Option<T>
where
    T: TryFrom<i64> + TryFrom<u64>,
{
    parse_integer::<T, SIGNED, false>(value, "value")
        .ok()
        .flatten()
}

// `REQUIRED=false` treats missing/null/type-mismatch as `Ok(None)`.
fn parse_integer<T, const SIGNED: bool, const REQUIRED: bool>(
    value: Option<&serde_json::Value>,
    field: &str,
) -> Result<Option<T>, CoreError>
where
    T: TryFrom<i64> + TryFrom<u64>,
{
    let missing_or_none = || {
        if REQUIRED {
            Err(CoreError::InvalidTxData(format!("missing {field}")))
        } else {
            Ok(None)
        }
    };

    let Some(value) = value else {
        return missing_or_none();
    };

    if SIGNED {
        let Some(n) = value.as_i64() else {
            return missing_or_none();
        };
        T::try_from(n)
            .map(Some)
            .map_err(|_| CoreError::InvalidTxData(format!("{field} out of range: {n}")))
    } else {
        let Some(n) = value.as_u64() else {
            return missing_or_none();
        };
        T::try_from(n)
            .map(Some)
            .map_err(|_| CoreError::InvalidTxData(format!("{field} out of range: {n}")))
    }
}

fn parse_vin(vin: &[serde_json::Value]) -> Result<Vec<ResolvedInput>, CoreError> {
    vin.iter()
        .map(|input| {
            let prevout = if input.get("coinbase").is_some() {
                None
            } else {
                let prev_txid = parse_txid(input.get("txid"), "vin.txid")?;
                let prev_vout =
                    parse_integer_required::<u32, false>(input.get("vout"), "vin.vout")?;
                Some(OutPoint::new(prev_txid, prev_vout))
            };

            // Only present with `getrawtransaction` verbosity 2+.
            let prevout_obj = input.get("prevout");
            let value = prevout_obj
                .and_then(|p| p.get("value"))
                .and_then(|v| parse_btc_amount(v).ok());
            let address = prevout_obj
                .and_then(|p| p.get("scriptPubKey"))
                .and_then(parse_address);

            Ok(ResolvedInput {
                prevout,
                value,
                address,
                creation_time: None,
            })
        })
        .collect()
}

fn parse_vout(vout: &[serde_json::Value]) -> Result<Vec<ResolvedOutput>, CoreError> {
    vout.iter()
        .enumerate()
        .map(|(position, output)| {
            let value = parse_btc_amount(
                output
                    .get("value")
                    .ok_or_else(|| CoreError::InvalidTxData("missing value in vout".into()))?,
            )?;
            let index = parse_integer_optional::<u32, false>(output.get("n"))
                .unwrap_or(position as u32);

            let spk = output
                .get("scriptPubKey")
                .ok_or_else(|| CoreError::InvalidTxData("missing scriptPubKey in vout".into()))?;
            let script = parse_script_pubkey_from_json(spk)?;

            Ok(ResolvedOutput {
                index,
                value,
                address: parse_address(spk),
                script_pub_key: Some(script),
                is_spent: false,
                spending_txid: None,
            })
        })
        .collect()
}

/// Newer nodes report `address`; older ones an `addresses` array.
fn parse_address(spk: &serde_json::Value) -> Option<String> {
    spk.get("address")
        .and_then(serde_json::Value::as_str)
        .or_else(|| {
            spk.get("addresses")
                .and_then(serde_json::Value::as_array)
                .and_then(|a| a.first())
                .and_then(serde_json::Value::as_str)
        })
        .map(str::to_owned)
}

fn parse_script_pubkey_from_json(spk: &serde_json::Value) -> Result<ScriptBuf, CoreError> {
    let hex_str = spk
        .get("hex")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| CoreError::InvalidTxData("missing hex in scriptPubKey".into()))?;
    ScriptBuf::from_hex(hex_str)
        .map_err(|e| CoreError::InvalidTxData(format!("invalid scriptPubKey hex: {e}")))
}

/// Parse a BTC amount from a JSON value.
///
/// Number values are parsed via `Amount::from_float_in` to support scientific
/// notation, while string values are parsed via `Amount::from_str_in`.
/// Anything above `Amount::MAX_MONEY` is rejected.
pub(crate) fn parse_btc_amount(value: &serde_json::Value) -> Result<Amount, CoreError> {
    let amount = parse_btc_number(value)?;
    if amount > Amount::MAX_MONEY {
        return Err(CoreError::InvalidTxData(format!(
            "BTC amount `{value}` exceeds the money supply"
        )));
    }
    Ok(amount)
}

fn parse_btc_number(value: &serde_json::Value) -> Result<Amount, CoreError> {
    match value {
        serde_json::Value::Number(n) => {
            let parsed = n
                .as_f64()
                .ok_or_else(|| CoreError::InvalidTxData(format!("invalid BTC amount `{value}`")))?;
            Amount::from_float_in(parsed, bitcoin::Denomination::Bitcoin)
                .map_err(|e| CoreError::InvalidTxData(format!("invalid BTC amount `{value}`: {e}")))
        }
        serde_json::Value::String(s) => Amount::from_str_in(s, bitcoin::Denomination::Bitcoin)
            .map_err(|e| CoreError::InvalidTxData(format!("invalid BTC amount `{s}`: {e}"))),
        _ => Err(CoreError::InvalidTxData(format!(
            "expected numeric BTC amount, got: {value}"
        ))),
    }
}
