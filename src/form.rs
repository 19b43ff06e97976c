// ============================================
// LOAN APPLICATION FORM
// Wire shape of the browser form and its mapping to workflow inputs
// ============================================

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Number;

/// Loan application as submitted by the browser. Every field is optional;
/// numbers may arrive as JSON numbers or numeric strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoanApplicationForm {
    // Company
    #[serde(deserialize_with = "lenient::text")]
    pub company_name: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub industry: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub establishment_date: Option<String>,
    #[serde(deserialize_with = "lenient::number")]
    pub capital: Option<Number>,
    #[serde(deserialize_with = "lenient::text")]
    pub representative: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub employees: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub location: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub business_description: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub major_customers: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub major_suppliers: Option<String>,

    // Loan request
    #[serde(deserialize_with = "lenient::number")]
    pub loan_amount: Option<Number>,
    #[serde(deserialize_with = "lenient::text")]
    pub usage_type: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub specific_usage: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub required_timing: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub funding_plan_details: Option<String>,

    // Repayment
    #[serde(deserialize_with = "lenient::number")]
    pub loan_term: Option<Number>,
    #[serde(deserialize_with = "lenient::number")]
    pub grace_period: Option<Number>,
    #[serde(deserialize_with = "lenient::text")]
    pub repayment_method: Option<String>,
    #[serde(deserialize_with = "lenient::number")]
    pub interest_rate: Option<Number>,
    #[serde(deserialize_with = "lenient::text")]
    pub rate_type: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub repayment_source: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub desired_execution_date: Option<String>,

    // Collateral
    #[serde(deserialize_with = "lenient::text")]
    pub collateral_type: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub collateral_details: Option<String>,
    #[serde(deserialize_with = "lenient::number")]
    pub collateral_value: Option<Number>,
    #[serde(deserialize_with = "lenient::text")]
    pub collateral_rank: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub guarantor_info: Option<String>,

    // Banking
    #[serde(deserialize_with = "lenient::text")]
    pub main_bank: Option<String>,
    #[serde(deserialize_with = "lenient::number")]
    pub our_bank_share: Option<Number>,
    #[serde(deserialize_with = "lenient::number")]
    pub other_banks_total: Option<Number>,
    #[serde(deserialize_with = "lenient::text")]
    pub other_banks_details: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub repayment_history: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub additional_info: Option<String>,
}

/// Flat workflow inputs. Field order is the order the provider receives.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkflowInputs {
    pub company_name: String,
    pub industry: String,
    pub establishment_date: String,
    pub capital: Number,
    pub representative: String,
    pub employees: String,
    pub location: String,
    pub business_description: String,

    pub loan_amount: Number,
    pub usage_type: String,
    pub specific_usage: String,
    pub required_timing: String,
    pub funding_plan_details: String,

    pub loan_term: Number,
    pub grace_period: Number,
    pub repayment_method: String,
    pub interest_rate: Number,
    pub rate_type: String,
    pub repayment_source: String,
    pub desired_execution_date: String,

    pub collateral_type: String,
    pub collateral_details: String,
    pub collateral_value: Number,
    pub collateral_rank: String,
    pub guarantor_info: String,

    pub main_bank: String,
    pub our_bank_share: Number,
    pub other_banks_total: Number,
    pub other_banks_details: String,
    pub repayment_history: String,

    pub additional_info: String,
}

fn text(v: &Option<String>) -> String {
    v.clone().unwrap_or_default()
}

fn num(v: &Option<Number>) -> Number {
    v.clone().unwrap_or_else(|| Number::from(0))
}

impl LoanApplicationForm {
    /// Missing text becomes `""` and missing numbers become `0`; nothing here fails.
    pub fn to_inputs(&self) -> WorkflowInputs {
        WorkflowInputs {
            company_name: text(&self.company_name),
            industry: text(&self.industry),
            establishment_date: text(&self.establishment_date),
            capital: num(&self.capital),
            representative: text(&self.representative),
            employees: text(&self.employees),
            location: text(&self.location),
            business_description: text(&self.business_description),

            loan_amount: num(&self.loan_amount),
            usage_type: text(&self.usage_type),
            specific_usage: text(&self.specific_usage),
            required_timing: text(&self.required_timing),
            funding_plan_details: text(&self.funding_plan_details),

            loan_term: num(&self.loan_term),
            grace_period: num(&self.grace_period),
            repayment_method: text(&self.repayment_method),
            interest_rate: num(&self.interest_rate),
            rate_type: text(&self.rate_type),
            repayment_source: text(&self.repayment_source),
            desired_execution_date: text(&self.desired_execution_date),

            collateral_type: text(&self.collateral_type),
            collateral_details: text(&self.collateral_details),
            collateral_value: num(&self.collateral_value),
            collateral_rank: text(&self.collateral_rank),
            guarantor_info: text(&self.guarantor_info),

            main_bank: text(&self.main_bank),
            our_bank_share: num(&self.our_bank_share),
            other_banks_total: num(&self.other_banks_total),
            other_banks_details: text(&self.other_banks_details),
            repayment_history: text(&self.repayment_history),

            additional_info: text(&self.additional_info),
        }
    }
}

mod lenient {
    use super::*;
    use serde_json::Value;

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Number>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => Some(n),
            Value::String(s) => parse_number(s.trim()),
            _ => None,
        })
    }

    fn parse_number(s: &str) -> Option<Number> {
        if s.is_empty() {
            return None;
        }
        if let Ok(i) = s.parse::<i64>() {
            return Some(Number::from(i));
        }
        s.parse::<f64>().ok().and_then(Number::from_f64)
    }
}
