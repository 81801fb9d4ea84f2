//! 价格/数量量化模块
//!
//! 所有提交给网关的价格和数量都必须先对齐到交易对的
//! tick_size / lot_size，否则会被交易所以 "not a multiple of
//! tick size" 为由拒绝。

/// 推断步长的小数位数，用于清除浮点尾数
///
/// 0.00001 -> 5, 0.5 -> 1, 5.0 -> 0
fn decimals_for_step(step: f64) -> i32 {
    if step <= 0.0 {
        return 0;
    }
    let mut decimals = 0;
    let mut scaled = step;
    while decimals < 12 {
        let rounded = scaled.round();
        if (scaled - rounded).abs() < 1e-9 && rounded >= 1.0 {
            break;
        }
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

/// 把数值对齐到步长的整数倍（四舍五入），并清除浮点尾数
fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let multiples = (value / step).round();
    let aligned = multiples * step;
    let decimals = decimals_for_step(step);
    let factor = 10_f64.powi(decimals);
    (aligned * factor).round() / factor
}

/// 价格量化：对齐到 tick_size 的整数倍
pub fn quantize_price(price: f64, tick_size: f64) -> f64 {
    round_to_step(price, tick_size)
}

/// 数量量化：对齐到 lot_size 的整数倍
///
/// lot_size 既可能是极小的小数（如 0.00001），也可能是 ≥1 的整数。
/// 量化绝不能把一个有效数量（> 0.5 × lot_size）压成 0。
pub fn quantize_quantity(quantity: f64, lot_size: f64) -> f64 {
    if lot_size <= 0.0 {
        return quantity;
    }
    let mut aligned = round_to_step(quantity, lot_size);
    if aligned <= 0.0 && quantity > 0.5 * lot_size {
        aligned = lot_size;
    }
    aligned
}
