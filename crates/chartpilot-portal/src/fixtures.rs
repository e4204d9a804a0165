//! 离线模拟数据
//!
//! 受限运行环境下无法启动浏览器，会话返回以下固定数据。

use chartpilot_core::{PatientRecord, Visit, VisitStatus};

/// 固定的两名演示患者
pub fn patients() -> Vec<PatientRecord> {
    vec![
        PatientRecord {
            patient_key: "demo_001".to_string(),
            name: "Demo Patient 1".to_string(),
            dob: Some("1980-01-15".to_string()),
            address: Some("123 Main St, City, ST 12345".to_string()),
            phone: Some("(555) 123-4567".to_string()),
            status: Some("Active".to_string()),
        },
        PatientRecord {
            patient_key: "demo_002".to_string(),
            name: "Demo Patient 2".to_string(),
            dob: Some("1975-06-22".to_string()),
            address: Some("456 Oak Ave, Town, ST 67890".to_string()),
            phone: Some("(555) 987-6543".to_string()),
            status: Some("Active".to_string()),
        },
    ]
}

/// 每名患者相同的访视列表
pub fn visits(_patient_key: &str) -> Vec<Visit> {
    vec![
        Visit {
            visit_id: "visit_001".to_string(),
            date: "2024-07-26".to_string(),
            status: VisitStatus::Unsigned,
        },
        Visit {
            visit_id: "visit_002".to_string(),
            date: "2024-07-25".to_string(),
            status: VisitStatus::Signed,
        },
    ]
}
