use crate::{
    error::{Error, Result},
    order::{FIELD_ORDER_ID, FIELD_USER_ID, FIELD_VOUCHER_ID},
    store::{Script, ScriptContext},
};

/// Admission script.
///
/// - `KEYS`: stock counter, buyer set, order stream.
/// - `ARGV`: voucher id, user id, order id.
/// - Returns `0` (admitted, intent appended), `1` (no stock) or `2` (user
///   already admitted for this voucher).
///
/// A missing stock counter counts as zero.
pub static SECKILL_SCRIPT: Script = Script::new(
    "seckill",
    r"
local voucherId = ARGV[1]
local userId = ARGV[2]
local orderId = ARGV[3]

local stock = tonumber(redis.call('get', KEYS[1]) or '0')
if stock <= 0 then
    return 1
end
if redis.call('sismember', KEYS[2], userId) == 1 then
    return 2
end
redis.call('incrby', KEYS[1], -1)
redis.call('sadd', KEYS[2], userId)
redis.call('xadd', KEYS[3], '*', 'id', orderId, 'userId', userId, 'voucherId', voucherId)
return 0
",
    seckill,
);

fn seckill(ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> Result<i64> {
    let ([stock_key, buyers_key, stream], [voucher_id, user_id, order_id]) = (keys, args) else {
        return Err(Error::store(
            "seckill expects 3 KEYS (stock, buyers, stream) and 3 ARGV (voucher, user, order)",
        ));
    };

    let stock = match ctx.get(stock_key)? {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| Error::store(format!("stock at `{stock_key}` is not an integer")))?,
        None => 0,
    };
    if stock <= 0 {
        return Ok(1);
    }
    if ctx.sismember(buyers_key, user_id)? {
        return Ok(2);
    }

    ctx.incr_by(stock_key, -1)?;
    ctx.sadd(buyers_key, user_id)?;
    ctx.xadd(
        stream,
        vec![
            (FIELD_ORDER_ID.to_string(), order_id.clone()),
            (FIELD_USER_ID.to_string(), user_id.clone()),
            (FIELD_VOUCHER_ID.to_string(), voucher_id.clone()),
        ],
    )?;
    Ok(0)
}
