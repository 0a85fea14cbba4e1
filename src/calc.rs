use serde::Serialize;

/// Row (or column) summary shown next to the grid.
///
/// Only scores `> 0` take part: a `0` counts as "not yet meaningfully
/// scored", exactly like an empty cell, so it lowers neither the total nor
/// the count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Aggregate {
    pub total: f64,
    pub count: usize,
    pub average: f64,
    pub grade: &'static str,
}

impl Aggregate {
    /// Same figures rounded to two decimals for display.
    pub fn rounded(self) -> Self {
        Self {
            total: round_2(self.total),
            average: round_2(self.average),
            ..self
        }
    }
}

pub fn aggregate<I>(scores: I) -> Aggregate
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut total = 0.0;
    let mut count: usize = 0;
    for v in scores.into_iter().flatten() {
        if v > 0.0 {
            total += v;
            count += 1;
        }
    }
    let average = if count > 0 { total / count as f64 } else { 0.0 };
    Aggregate {
        total,
        count,
        average,
        grade: grade_letter(average),
    }
}

pub fn grade_letter(average: f64) -> &'static str {
    if average >= 8.5 {
        "A"
    } else if average >= 7.0 {
        "B"
    } else if average >= 5.5 {
        "C"
    } else if average >= 4.0 {
        "D"
    } else if average > 0.0 {
        "F"
    } else {
        "-"
    }
}

/// Two-decimal rounding for display payloads.
pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_blank_are_excluded() {
        let a = aggregate([Some(0.0), Some(7.0), None, Some(8.0)]);
        assert_eq!(a.total, 15.0);
        assert_eq!(a.count, 2);
        assert_eq!(a.average, 7.5);
        assert_eq!(a.grade, "B");
    }

    #[test]
    fn nothing_scored_is_dash() {
        let a = aggregate([None, Some(0.0)]);
        assert_eq!(a.count, 0);
        assert_eq!(a.average, 0.0);
        assert_eq!(a.grade, "-");
    }

    #[test]
    fn grade_boundaries() {
        assert_eq!(grade_letter(10.0), "A");
        assert_eq!(grade_letter(8.5), "A");
        assert_eq!(grade_letter(8.49), "B");
        assert_eq!(grade_letter(7.0), "B");
        assert_eq!(grade_letter(5.5), "C");
        assert_eq!(grade_letter(4.0), "D");
        assert_eq!(grade_letter(3.99), "F");
        assert_eq!(grade_letter(0.01), "F");
        assert_eq!(grade_letter(0.0), "-");
    }

    #[test]
    fn rounded_for_display() {
        assert_eq!(round_2(7.333333), 7.33);
        let a = aggregate([Some(7.0), Some(7.0), Some(8.0)]).rounded();
        assert_eq!(a.average, 7.33);
        assert_eq!(a.total, 22.0);
        assert_eq!(a.grade, "B");
    }
}
