use crate::models::{Rule, RuleStatus};

/// Round half-up to `precision` decimal places.
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Recompute the rule's thresholds for the current price.
///
/// Thresholds are ratchets: they only tighten in the favorable direction
/// and never loosen on an unfavorable move.
///
/// While Bought, a new high raises the high-water mark and with it the
/// stop-loss and risk prices; a price below the prior high changes nothing.
/// While Sold, a new low lowers the low-water mark and the entry cap.
/// Idempotent for a given (rule, price) pair; never places orders.
pub fn recompute(rule: &mut Rule, current_price: f64, precision: u32) {
    rule.current_price = Some(current_price);

    match rule.status {
        RuleStatus::Bought => {
            let high = match rule.high {
                Some(high) if current_price <= high => return,
                _ => current_price,
            };
            rule.high = Some(high);
            rule.stop_loss_price = Some(round_to(high * (1.0 - rule.stop_loss_pct / 100.0), precision));
            rule.risk_price = Some(round_to(high * (1.0 - rule.risk_limit_pct / 100.0), precision));
        }
        RuleStatus::Sold => {
            let low = match rule.low {
                Some(low) if current_price >= low => return,
                _ => current_price,
            };
            rule.low = Some(low);
            rule.limit_price = Some(round_to(low * (1.0 + rule.limit_pct / 100.0), precision));
        }
        RuleStatus::Idle | RuleStatus::Pending => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;

    fn bought_rule() -> Rule {
        let mut rule = Rule::new("BTC-USD", &RuleConfig::default());
        rule.status = RuleStatus::Bought;
        rule.stop_loss_pct = 1.0;
        rule.risk_limit_pct = 10.0;
        rule
    }

    fn sold_rule() -> Rule {
        let mut rule = Rule::new("BTC-USD", &RuleConfig::default());
        rule.status = RuleStatus::Sold;
        rule.limit_pct = 1.0;
        rule
    }

    #[test]
    fn test_round_half_up() {
        assert_eq!(round_to(96.0192, 2), 96.02);
        assert_eq!(round_to(99.005, 2), 99.01);
        assert_eq!(round_to(99.004, 2), 99.0);
    }

    #[test]
    fn test_bought_sets_thresholds_from_high() {
        let mut rule = bought_rule();
        recompute(&mut rule, 100.0, 2);

        assert_eq!(rule.high, Some(100.0));
        assert_eq!(rule.stop_loss_price, Some(99.0));
        assert_eq!(rule.risk_price, Some(90.0));
    }

    #[test]
    fn test_stop_loss_ratchets_up_never_down() {
        let mut rule = bought_rule();
        recompute(&mut rule, 100.0, 2);
        recompute(&mut rule, 110.0, 2);
        assert_eq!(rule.stop_loss_price, Some(108.9));

        // Price falls back: the ratchet holds.
        recompute(&mut rule, 95.0, 2);
        assert_eq!(rule.high, Some(110.0));
        assert_eq!(rule.stop_loss_price, Some(108.9));
    }

    #[test]
    fn test_sold_limit_ratchets_down() {
        let mut rule = sold_rule();
        recompute(&mut rule, 100.0, 2);
        assert_eq!(rule.limit_price, Some(101.0));

        recompute(&mut rule, 90.0, 2);
        assert_eq!(rule.low, Some(90.0));
        assert_eq!(rule.limit_price, Some(90.9));

        // Rebound does not loosen the entry cap.
        recompute(&mut rule, 95.0, 2);
        assert_eq!(rule.limit_price, Some(90.9));
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let mut once = bought_rule();
        recompute(&mut once, 100.0, 2);

        let mut twice = bought_rule();
        recompute(&mut twice, 100.0, 2);
        recompute(&mut twice, 100.0, 2);

        assert_eq!(once.stop_loss_price, twice.stop_loss_price);
        assert_eq!(once.risk_price, twice.risk_price);
        assert_eq!(once.high, twice.high);
    }

    #[test]
    fn test_idle_rule_is_untouched() {
        let mut rule = Rule::new("BTC-USD", &RuleConfig::default());
        recompute(&mut rule, 100.0, 2);
        assert_eq!(rule.high, None);
        assert_eq!(rule.stop_loss_price, None);
        assert_eq!(rule.current_price, Some(100.0));
    }
}
