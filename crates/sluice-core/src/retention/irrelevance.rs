//! Irrelevance スコア
//!
//! イベントの total irrelevance = item irrelevance（保存時に固定）+ age irrelevance
//! age irrelevance は epoch 単位の age の対数で増える：`floor(log_base(age + 1))`
//! base 2 なら age 0 → 0、age 1 → 1、age 3 → 2、age 7 → 3

use chrono::{DateTime, Utc};
use rand::Rng;

pub const DEFAULT_AGE_BASE: u32 = 2;

/// 設定しなければ 1 epoch は 1 時間
pub const DEFAULT_EPOCH_SECONDS: i64 = 3600;

/// 1970 年からの経過 epoch 数（端数切り捨て）
pub fn epoch_for(at: DateTime<Utc>, epoch_seconds: i64) -> i64 {
    at.timestamp().div_euclid(epoch_seconds.max(1))
}

pub fn datetime_for_epoch(epoch: i64, epoch_seconds: i64) -> Option<DateTime<Utc>> {
    epoch
        .checked_mul(epoch_seconds.max(1))
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// `floor(log_base(age + 1))` を整数で計算
pub fn age_irrelevance(age: u64, base: u32) -> u32 {
    let base = u64::from(base.max(2));
    let n = age.saturating_add(1);
    let mut irrelevance = 0;
    let mut power = base;
    while power <= n {
        irrelevance += 1;
        match power.checked_mul(base) {
            Some(next) => power = next,
            None => break,
        }
    }
    irrelevance
}

/// age の予算が届く age（epoch 単位）：`base^budget - 1`
/// `u64::MAX` で飽和
pub fn age_of_eviction(budget: u32, base: u32) -> u64 {
    u64::from(base.max(2))
        .checked_pow(budget)
        .map_or(u64::MAX, |p| p - 1)
}

/// 最上位の 1 から最下位の 1 までのビット数
///
/// `0b100000 -> 1`, `0b101000 -> 3`, `0b110001 -> 6`, `0 -> 0`
pub fn nonzero_leading_bits(n: u64) -> u32 {
    if n == 0 {
        return 0;
    }
    u64::BITS - n.leading_zeros() - n.trailing_zeros()
}

/// 保存済み件数から決まる新規イベントの item irrelevance
///
/// 件数が多いほど新しいイベントは平均的に relevant でなくなる
/// 乱数は件数がキリのいい数の付近にあるときにスコアが揃うのを防ぐ、係数 2 は乱数の平均の補正
pub fn item_irrelevance_for<R: Rng + ?Sized>(stored_event_count: u64, rng: &mut R) -> u32 {
    let draw: f64 = rng.gen_range(0.0..1.0);
    let scaled = (draw * stored_event_count as f64 * 2.0).round();
    nonzero_leading_bits(scaled as u64)
}

/// 保存件数が quota を超えたら削除の時期
pub fn should_evict(stored_event_count: u64, max_event_count: u64) -> bool {
    stored_event_count > max_event_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    #[rstest]
    #[case::age_0(0, 0)]
    #[case::age_1(1, 1)]
    #[case::age_2(2, 1)]
    #[case::age_3(3, 2)]
    #[case::age_6(6, 2)]
    #[case::age_7(7, 3)]
    #[case::age_1023(1023, 10)]
    fn age_irrelevance_base_2(#[case] age: u64, #[case] expected: u32) {
        assert_eq!(age_irrelevance(age, 2), expected);
    }

    #[rstest]
    #[case::age_0(0, 0)]
    #[case::age_2(2, 0)]
    #[case::age_3(3, 1)]
    #[case::age_15(15, 2)]
    fn age_irrelevance_base_4(#[case] age: u64, #[case] expected: u32) {
        assert_eq!(age_irrelevance(age, 4), expected);
    }

    #[test]
    fn age_irrelevance_handles_huge_ages() {
        assert_eq!(age_irrelevance(u64::MAX - 1, 2), 63);
        assert_eq!(age_irrelevance(u64::MAX, 2), 63);
    }

    #[test]
    fn age_of_eviction_inverts_age_irrelevance() {
        for budget in 0..20 {
            let age = age_of_eviction(budget, 2);
            assert_eq!(age_irrelevance(age, 2), budget);
            // 予算内に収まる最も古い age
            assert_eq!(age_irrelevance(age_of_eviction(budget + 1, 2) - 1, 2), budget);
        }
        assert_eq!(age_of_eviction(64, 2), u64::MAX);
    }

    #[rstest]
    #[case::zero(0, 0)]
    #[case::round(0b100000, 1)]
    #[case::some(0b101000, 3)]
    #[case::odd(0b110001, 6)]
    #[case::max(u64::MAX, 64)]
    fn leading_bits(#[case] n: u64, #[case] expected: u32) {
        assert_eq!(nonzero_leading_bits(n), expected);
    }

    #[test]
    fn epochs_are_hours_since_1970() {
        let at = Utc.with_ymd_and_hms(1970, 1, 2, 1, 30, 0).unwrap();
        assert_eq!(epoch_for(at, DEFAULT_EPOCH_SECONDS), 25);
        assert_eq!(
            datetime_for_epoch(25, DEFAULT_EPOCH_SECONDS),
            Some(Utc.with_ymd_and_hms(1970, 1, 2, 1, 0, 0).unwrap())
        );
    }

    #[test]
    fn item_irrelevance_is_bounded_by_the_count() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(item_irrelevance_for(0, &mut rng), 0);
        for _ in 0..1000 {
            // 2 * 1000 は 11 ビットに収まる
            assert!(item_irrelevance_for(1000, &mut rng) <= 11);
        }
    }

    #[test]
    fn eviction_is_due_only_over_quota() {
        assert!(!should_evict(10, 10));
        assert!(should_evict(11, 10));
    }
}
