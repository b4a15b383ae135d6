use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageAxis {
    pub coverage_percent: f64,
    pub total_items: usize,
    pub covered_items: usize,
}

fn axis(covered: usize, total: usize) -> CoverageAxis {
    let percent = (covered as f64 / total.max(1) as f64) * 100.0;
    CoverageAxis {
        coverage_percent: (percent * 10.0).round() / 10.0,
        total_items: total,
        covered_items: covered,
    }
}

/// Counts gathered from the stores over the issue window; "covered" means
/// the domain's terminal set (documents posted/processed, invoices out the
/// door, bank lines past NEW).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageInputs {
    pub receipts_total: usize,
    pub receipts_covered: usize,
    pub invoices_total: usize,
    pub invoices_covered: usize,
    pub banking_total: usize,
    pub banking_covered: usize,
    pub open_books_issues: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub receipts: CoverageAxis,
    pub invoices: CoverageAxis,
    pub banking: CoverageAxis,
    pub books: CoverageAxis,
}

impl Coverage {
    /// The domain with the lowest coverage, for playbook gap actions.
    #[must_use]
    pub fn lowest(&self) -> (&'static str, CoverageAxis) {
        let axes = [
            ("receipts", self.receipts),
            ("invoices", self.invoices),
            ("banking", self.banking),
            ("books", self.books),
        ];
        axes.into_iter()
            .min_by(|a, b| {
                a.1.coverage_percent
                    .partial_cmp(&b.1.coverage_percent)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(("books", self.books))
    }
}

/// Coverage per domain. Books has no per-item terminal state, so it is a
/// placeholder that starts at 100 % and loses 10 points per open books
/// issue.
#[must_use]
pub fn build_coverage(inputs: &CoverageInputs) -> Coverage {
    let books_percent = (100_i64 - inputs.open_books_issues as i64 * 10).max(0) as f64;
    let books_total = inputs.open_books_issues + 5;
    let books_covered = (books_total as f64 * books_percent / 100.0) as usize;

    Coverage {
        receipts: axis(inputs.receipts_covered, inputs.receipts_total),
        invoices: axis(inputs.invoices_covered, inputs.invoices_total),
        banking: axis(inputs.banking_covered, inputs.banking_total),
        books: CoverageAxis {
            coverage_percent: books_percent,
            total_items: books_total,
            covered_items: books_covered,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ratios_round_to_one_decimal() {
        let coverage = build_coverage(&CoverageInputs {
            receipts_total: 3,
            receipts_covered: 2,
            invoices_total: 10,
            invoices_covered: 10,
            banking_total: 0,
            banking_covered: 0,
            open_books_issues: 0,
        });
        assert_eq!(coverage.receipts.coverage_percent, 66.7);
        assert_eq!(coverage.invoices.coverage_percent, 100.0);
        assert_eq!(coverage.banking.coverage_percent, 0.0);
        assert_eq!(coverage.books.coverage_percent, 100.0);
    }

    #[test]
    fn books_placeholder_degrades_with_open_issues() {
        let coverage = build_coverage(&CoverageInputs {
            open_books_issues: 3,
            ..CoverageInputs::default()
        });
        assert_eq!(coverage.books.coverage_percent, 70.0);

        let floored = build_coverage(&CoverageInputs {
            open_books_issues: 20,
            ..CoverageInputs::default()
        });
        assert_eq!(floored.books.coverage_percent, 0.0);
    }

    #[test]
    fn lowest_picks_the_weakest_domain() {
        let coverage = build_coverage(&CoverageInputs {
            receipts_total: 10,
            receipts_covered: 9,
            invoices_total: 10,
            invoices_covered: 4,
            banking_total: 10,
            banking_covered: 8,
            open_books_issues: 0,
        });
        let (domain, axis) = coverage.lowest();
        assert_eq!(domain, "invoices");
        assert_eq!(axis.coverage_percent, 40.0);
    }
}
