use derive_more::Display;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use super::leave::LeaveType;

pub const BALANCE_COLUMNS: &str =
    "id, employee_id, year, leave_type, total_allocated, used, available";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct LeaveBalance {
    #[schema(example = 3)]
    pub id: u64,
    #[schema(example = 7)]
    pub employee_id: u64,
    #[schema(example = 2026)]
    pub year: i32,
    #[sqlx(try_from = "String")]
    pub leave_type: LeaveType,
    #[schema(example = 20)]
    pub total_allocated: i32,
    #[schema(example = 4)]
    pub used: i32,
    #[schema(example = 16)]
    pub available: i32,
}

#[derive(Debug, Display, PartialEq, Eq)]
pub enum BalanceError {
    #[display(fmt = "Insufficient leave balance")]
    Insufficient { available: i32, requested: i32 },
    #[display(fmt = "Total allocated cannot be less than used days ({})", used)]
    BelowUsed { used: i32 },
    #[display(fmt = "Allocation must not be negative")]
    Negative,
}

impl std::error::Error for BalanceError {}

impl LeaveBalance {
    pub fn new(
        employee_id: u64,
        year: i32,
        leave_type: LeaveType,
        total_allocated: i32,
    ) -> Result<Self, BalanceError> {
        if total_allocated < 0 {
            return Err(BalanceError::Negative);
        }
        Ok(Self {
            id: 0,
            employee_id,
            year,
            leave_type,
            total_allocated,
            used: 0,
            available: total_allocated,
        })
    }

    pub fn debit(&mut self, days: i32) -> Result<(), BalanceError> {
        if self.available < days {
            return Err(BalanceError::Insufficient {
                available: self.available,
                requested: days,
            });
        }
        self.used += days;
        self.recompute();
        Ok(())
    }

    pub fn reallocate(&mut self, total_allocated: i32) -> Result<(), BalanceError> {
        if total_allocated < 0 {
            return Err(BalanceError::Negative);
        }
        if total_allocated < self.used {
            return Err(BalanceError::BelowUsed { used: self.used });
        }
        self.total_allocated = total_allocated;
        self.recompute();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.used = 0;
        self.recompute();
    }

    fn recompute(&mut self) {
        self.available = self.total_allocated - self.used;
    }

    /// Share of the allocation already taken, in percent.
    pub fn utilization(&self) -> f64 {
        if self.total_allocated <= 0 {
            0.0
        } else {
            self.used as f64 / self.total_allocated as f64 * 100.0
        }
    }
}

/// Default yearly allocation used by bulk creation when HR gives none.
pub fn default_allocation(leave_type: LeaveType) -> i32 {
    match leave_type {
        LeaveType::Annual => 20,
        LeaveType::Sick => 10,
        LeaveType::Casual => 7,
        LeaveType::Maternity => 90,
        LeaveType::Paternity => 10,
        LeaveType::Unpaid => 30,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debit_keeps_available_in_sync() {
        let mut balance = LeaveBalance::new(1, 2026, LeaveType::Annual, 10).unwrap();
        balance.debit(4).unwrap();
        assert_eq!((balance.used, balance.available), (4, 6));

        let err = balance.debit(7).unwrap_err();
        assert_eq!(
            err,
            BalanceError::Insufficient {
                available: 6,
                requested: 7
            }
        );
        assert_eq!(balance.available, 6);

        balance.debit(6).unwrap();
        assert_eq!(balance.available, 0);
    }

    #[test]
    fn reallocation_cannot_drop_below_used() {
        let mut balance = LeaveBalance::new(1, 2026, LeaveType::Sick, 10).unwrap();
        balance.debit(5).unwrap();
        assert_eq!(
            balance.reallocate(3).unwrap_err(),
            BalanceError::BelowUsed { used: 5 }
        );
        balance.reallocate(12).unwrap();
        assert_eq!(balance.available, 7);
        assert!(LeaveBalance::new(1, 2026, LeaveType::Sick, -1).is_err());
    }

    #[test]
    fn reset_restores_full_allocation() {
        let mut balance = LeaveBalance::new(1, 2026, LeaveType::Casual, 7).unwrap();
        balance.debit(3).unwrap();
        balance.reset();
        assert_eq!((balance.used, balance.available), (0, 7));
        assert_eq!(balance.utilization(), 0.0);
    }
}
