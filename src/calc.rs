use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

/// Passing threshold shared by trimester-level and final-level checks.
pub const PASSING_AVERAGE: f64 = 3.0;

/// Valid range for a stored grade value.
pub const GRADE_MIN: f64 = 1.0;
pub const GRADE_MAX: f64 = 5.0;

/// 1-decimal half-up rounding used for trimester averages:
/// `floor(10*x + 0.5) / 10`.
pub fn round_half_up_1(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// 1-decimal truncation used for the final average: `floor(10*x) / 10`.
///
/// Final averages truncate while trimester averages round. The asymmetry is
/// contractual: a final mean of 3.45 stays 3.4, it does not become 3.5.
pub fn truncate_1(x: f64) -> f64 {
    (10.0 * x).floor() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Homework,
    Partial,
    Exam,
}

impl ActivityKind {
    /// Fixed weight table: homework 1, partial 2, exam 3.
    pub fn weight(self) -> f64 {
        match self {
            ActivityKind::Homework => 1.0,
            ActivityKind::Partial => 2.0,
            ActivityKind::Exam => 3.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::Homework => "homework",
            ActivityKind::Partial => "partial",
            ActivityKind::Exam => "exam",
        }
    }

    pub fn parse(s: &str) -> Option<ActivityKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "homework" => Some(ActivityKind::Homework),
            "partial" => Some(ActivityKind::Partial),
            "exam" => Some(ActivityKind::Exam),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trimester {
    First,
    Second,
    Third,
}

impl Trimester {
    pub const ALL: [Trimester; 3] = [Trimester::First, Trimester::Second, Trimester::Third];

    pub fn as_str(self) -> &'static str {
        match self {
            Trimester::First => "1T",
            Trimester::Second => "2T",
            Trimester::Third => "3T",
        }
    }

    pub fn parse(s: &str) -> Option<Trimester> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1T" => Some(Trimester::First),
            "2T" => Some(Trimester::Second),
            "3T" => Some(Trimester::Third),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: String,
    pub name: String,
    pub grade_label: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentDef {
    pub id: String,
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherRow {
    pub id: String,
    pub name: String,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct GradeEntry {
    pub student_id: String,
    pub assignment_id: String,
    pub teacher_id: String,
    pub trimester: Trimester,
    pub value: Option<f64>,
}

/// An already-resident snapshot of the grade store. The averaging functions
/// below are pure over this snapshot and never touch the database themselves;
/// handlers load a fresh snapshot per request, so results always reflect the
/// latest writes.
#[derive(Debug, Clone)]
pub struct GradeBook {
    pub students: Vec<StudentRow>,
    pub assignments: Vec<AssignmentDef>,
    pub teachers: Vec<TeacherRow>,
    pub entries: Vec<GradeEntry>,
    kind_by_assignment: HashMap<String, ActivityKind>,
}

impl GradeBook {
    pub fn new(
        students: Vec<StudentRow>,
        assignments: Vec<AssignmentDef>,
        teachers: Vec<TeacherRow>,
        entries: Vec<GradeEntry>,
    ) -> Self {
        let kind_by_assignment = assignments
            .iter()
            .filter_map(|a| ActivityKind::parse(&a.kind).map(|k| (a.id.clone(), k)))
            .collect();
        Self {
            students,
            assignments,
            teachers,
            entries,
            kind_by_assignment,
        }
    }

    /// Weight for one entry's assignment. Unrecognized or missing assignments
    /// fall back to weight 1 rather than erroring.
    pub fn weight_of(&self, assignment_id: &str) -> f64 {
        self.kind_by_assignment
            .get(assignment_id)
            .map(|k| k.weight())
            .unwrap_or(1.0)
    }

    pub fn value_of(
        &self,
        student_id: &str,
        assignment_id: &str,
        teacher_id: &str,
        trimester: Trimester,
    ) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| {
                e.student_id == student_id
                    && e.assignment_id == assignment_id
                    && e.teacher_id == teacher_id
                    && e.trimester == trimester
            })
            .and_then(|e| e.value)
    }
}

/// Weighted trimester average for one (student, teacher, trimester) scope,
/// rounded half-up to one decimal. Ungraded entries are excluded from both
/// the numerator and the denominator. No matching graded entries yields
/// exactly 0.0.
pub fn trimester_average(
    book: &GradeBook,
    student_id: &str,
    teacher_id: &str,
    trimester: Trimester,
) -> f64 {
    let mut weighted_sum = 0.0_f64;
    let mut total_weight = 0.0_f64;

    for entry in &book.entries {
        if entry.student_id != student_id
            || entry.teacher_id != teacher_id
            || entry.trimester != trimester
        {
            continue;
        }
        let Some(value) = entry.value else {
            continue;
        };
        let weight = book.weight_of(&entry.assignment_id);
        weighted_sum += value * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        round_half_up_1(weighted_sum / total_weight)
    } else {
        0.0
    }
}

/// Final average: mean of the three trimester averages, truncated to one
/// decimal. A trimester with no graded entries contributes 0.0 to the mean,
/// it is not skipped.
pub fn final_average(book: &GradeBook, student_id: &str, teacher_id: &str) -> f64 {
    let sum: f64 = Trimester::ALL
        .iter()
        .map(|t| trimester_average(book, student_id, teacher_id, *t))
        .sum();
    truncate_1(sum / 3.0)
}

pub fn has_passed(average: f64) -> bool {
    average >= PASSING_AVERAGE
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStats {
    pub total_students: usize,
    pub approved_students: usize,
    pub failed_students: usize,
    pub approval_percentage: f64,
    pub failure_percentage: f64,
}

/// Cohort pass/fail statistics over a roster for one teacher. An empty roster
/// reports 0% approval and 0% failure rather than dividing by zero.
pub fn approval_stats<'a, I>(book: &GradeBook, roster: I, teacher_id: &str) -> ApprovalStats
where
    I: IntoIterator<Item = &'a str>,
{
    let mut total = 0_usize;
    let mut approved = 0_usize;

    for student_id in roster {
        total += 1;
        if has_passed(final_average(book, student_id, teacher_id)) {
            approved += 1;
        }
    }

    let failed = total - approved;
    let (approval_percentage, failure_percentage) = if total > 0 {
        (
            approved as f64 / total as f64 * 100.0,
            failed as f64 / total as f64 * 100.0,
        )
    } else {
        (0.0, 0.0)
    };

    ApprovalStats {
        total_students: total,
        approved_students: approved,
        failed_students: failed,
        approval_percentage,
        failure_percentage,
    }
}

/// Per-student summary row used by the averages surfaces and the export path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAverages {
    pub student_id: String,
    pub name: String,
    pub grade_label: String,
    pub t1: f64,
    pub t2: f64,
    pub t3: f64,
    pub final_average: f64,
    pub passed: bool,
}

pub fn student_averages(
    book: &GradeBook,
    student: &StudentRow,
    teacher_id: &str,
) -> StudentAverages {
    let t1 = trimester_average(book, &student.id, teacher_id, Trimester::First);
    let t2 = trimester_average(book, &student.id, teacher_id, Trimester::Second);
    let t3 = trimester_average(book, &student.id, teacher_id, Trimester::Third);
    let final_avg = final_average(book, &student.id, teacher_id);
    StudentAverages {
        student_id: student.id.clone(),
        name: student.name.clone(),
        grade_label: student.grade_label.clone(),
        t1,
        t2,
        t3,
        final_average: final_avg,
        passed: has_passed(final_avg),
    }
}

/// Loads a snapshot of the grade store. When `teacher_id` is given, only that
/// teacher's grade entries are loaded; students, assignments and the teacher
/// roster always load in full.
pub fn load_grade_book(
    conn: &Connection,
    teacher_id: Option<&str>,
) -> Result<GradeBook, CalcError> {
    let mut students_stmt = conn
        .prepare(
            "SELECT id, name, grade_label, sort_order
             FROM students
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let students: Vec<StudentRow> = students_stmt
        .query_map([], |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                name: r.get(1)?,
                grade_label: r.get(2)?,
                sort_order: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut assignments_stmt = conn
        .prepare(
            "SELECT id, name, kind, attachment, sort_order
             FROM assignments
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let assignments: Vec<AssignmentDef> = assignments_stmt
        .query_map([], |r| {
            Ok(AssignmentDef {
                id: r.get(0)?,
                name: r.get(1)?,
                kind: r.get(2)?,
                attachment: r.get(3)?,
                sort_order: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut teachers_stmt = conn
        .prepare(
            "SELECT id, name, COALESCE(subject, '')
             FROM users
             WHERE role = 'teacher'
             ORDER BY name",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let teachers: Vec<TeacherRow> = teachers_stmt
        .query_map([], |r| {
            Ok(TeacherRow {
                id: r.get(0)?,
                name: r.get(1)?,
                subject: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let raw_entries: Vec<Option<GradeEntry>> = match teacher_id {
        Some(tid) => {
            let mut stmt = conn
                .prepare(
                    "SELECT student_id, assignment_id, teacher_id, trimester, value
                     FROM grade_entries
                     WHERE teacher_id = ?",
                )
                .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
            stmt.query_map([tid], map_entry_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?
        }
        None => {
            let mut stmt = conn
                .prepare(
                    "SELECT student_id, assignment_id, teacher_id, trimester, value
                     FROM grade_entries",
                )
                .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
            stmt.query_map([], map_entry_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?
        }
    };

    // Rows with an unknown trimester label are dropped at load; the writers
    // only accept 1T/2T/3T, so this only matters for hand-edited databases.
    let entries = raw_entries.into_iter().flatten().collect();

    Ok(GradeBook::new(students, assignments, teachers, entries))
}

fn map_entry_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Option<GradeEntry>> {
    let trimester_label: String = r.get(3)?;
    let Some(trimester) = Trimester::parse(&trimester_label) else {
        return Ok(None);
    };
    Ok(Some(GradeEntry {
        student_id: r.get(0)?,
        assignment_id: r.get(1)?,
        teacher_id: r.get(2)?,
        trimester,
        value: r.get(4)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(id: &str) -> StudentRow {
        StudentRow {
            id: id.to_string(),
            name: format!("Student {}", id),
            grade_label: "5th".to_string(),
            sort_order: 0,
        }
    }

    fn assignment(id: &str, kind: ActivityKind) -> AssignmentDef {
        AssignmentDef {
            id: id.to_string(),
            name: format!("Assignment {}", id),
            kind: kind.as_str().to_string(),
            attachment: None,
            sort_order: 0,
        }
    }

    fn entry(
        student_id: &str,
        assignment_id: &str,
        trimester: Trimester,
        value: Option<f64>,
    ) -> GradeEntry {
        GradeEntry {
            student_id: student_id.to_string(),
            assignment_id: assignment_id.to_string(),
            teacher_id: "t1".to_string(),
            trimester,
            value,
        }
    }

    fn book(assignments: Vec<AssignmentDef>, entries: Vec<GradeEntry>) -> GradeBook {
        GradeBook::new(vec![student("s1")], assignments, Vec::new(), entries)
    }

    #[test]
    fn one_decimal_helpers() {
        assert_eq!(round_half_up_1(0.0), 0.0);
        assert_eq!(round_half_up_1(3.54), 3.5);
        assert_eq!(round_half_up_1(3.55), 3.6);
        assert_eq!(truncate_1(3.45), 3.4);
        assert_eq!(truncate_1(3.49), 3.4);
        assert_eq!(truncate_1(3.4), 3.4);
    }

    #[test]
    fn uniform_weight_equals_simple_mean() {
        let b = book(
            vec![
                assignment("a1", ActivityKind::Homework),
                assignment("a2", ActivityKind::Homework),
                assignment("a3", ActivityKind::Homework),
            ],
            vec![
                entry("s1", "a1", Trimester::First, Some(2.0)),
                entry("s1", "a2", Trimester::First, Some(3.0)),
                entry("s1", "a3", Trimester::First, Some(4.0)),
            ],
        );
        assert_eq!(trimester_average(&b, "s1", "t1", Trimester::First), 3.0);
    }

    #[test]
    fn weighted_average_by_activity_kind() {
        // homework 2.0 (w=1), exam 4.0 (w=3): (2 + 12) / 4 = 3.5
        let b = book(
            vec![
                assignment("hw", ActivityKind::Homework),
                assignment("ex", ActivityKind::Exam),
            ],
            vec![
                entry("s1", "hw", Trimester::First, Some(2.0)),
                entry("s1", "ex", Trimester::First, Some(4.0)),
            ],
        );
        assert_eq!(trimester_average(&b, "s1", "t1", Trimester::First), 3.5);
    }

    #[test]
    fn ungraded_entries_do_not_count() {
        let b = book(
            vec![
                assignment("a1", ActivityKind::Homework),
                assignment("a2", ActivityKind::Exam),
            ],
            vec![
                entry("s1", "a1", Trimester::First, Some(4.0)),
                entry("s1", "a2", Trimester::First, None),
            ],
        );
        // The null exam is excluded entirely, not treated as zero.
        assert_eq!(trimester_average(&b, "s1", "t1", Trimester::First), 4.0);
    }

    #[test]
    fn empty_scope_yields_exactly_zero() {
        let b = book(vec![assignment("a1", ActivityKind::Homework)], Vec::new());
        assert_eq!(trimester_average(&b, "s1", "t1", Trimester::First), 0.0);
        assert_eq!(trimester_average(&b, "s1", "t1", Trimester::Second), 0.0);
    }

    #[test]
    fn unknown_assignment_falls_back_to_weight_one() {
        // One graded entry points at an assignment the store no longer has.
        let b = book(
            vec![assignment("ex", ActivityKind::Exam)],
            vec![
                entry("s1", "ex", Trimester::First, Some(4.0)),
                entry("s1", "gone", Trimester::First, Some(2.0)),
            ],
        );
        // (4*3 + 2*1) / 4 = 3.5
        assert_eq!(trimester_average(&b, "s1", "t1", Trimester::First), 3.5);
    }

    #[test]
    fn final_average_truncates_instead_of_rounding() {
        // A mean ending in a terminal 5 at the second decimal: truncation
        // keeps 3.4 where rounding would have produced 3.5.
        let mean = (3.47_f64 + 3.43 + 3.45) / 3.0;
        assert_eq!(truncate_1(mean), 3.4);
        assert_eq!(round_half_up_1(mean), 3.5);
    }

    #[test]
    fn final_average_over_engine_values() {
        // T1 = 3.5, T2 = 3.5, T3 = 3.4 -> mean 3.4666... -> truncated 3.4.
        let b = book(
            vec![assignment("hw", ActivityKind::Homework)],
            vec![
                entry("s1", "hw", Trimester::First, Some(3.5)),
                entry("s1", "hw", Trimester::Second, Some(3.5)),
                entry("s1", "hw", Trimester::Third, Some(3.4)),
            ],
        );
        assert_eq!(final_average(&b, "s1", "t1"), 3.4);
    }

    #[test]
    fn empty_trimester_contributes_zero_to_final() {
        // Only T1 graded at 4.5; T2/T3 contribute 0.0 each, they are not
        // excluded from the mean. 4.5 / 3 = 1.5.
        let b = book(
            vec![assignment("hw", ActivityKind::Homework)],
            vec![entry("s1", "hw", Trimester::First, Some(4.5))],
        );
        assert_eq!(final_average(&b, "s1", "t1"), 1.5);
    }

    #[test]
    fn passing_boundary_is_inclusive_at_three() {
        assert!(has_passed(3.0));
        assert!(has_passed(4.9));
        assert!(!has_passed(2.99));
        assert!(!has_passed(0.0));
    }

    #[test]
    fn approval_stats_counts_and_percentages() {
        // 10 students: 7 graded at 4.0 across all trimesters, 3 at 2.0.
        let mut entries = Vec::new();
        let mut roster = Vec::new();
        for i in 0..10 {
            let sid = format!("s{}", i);
            let value = if i < 7 { 4.0 } else { 2.0 };
            for t in Trimester::ALL {
                entries.push(entry(&sid, "hw", t, Some(value)));
            }
            roster.push(sid);
        }
        let b = book(vec![assignment("hw", ActivityKind::Homework)], entries);
        let stats = approval_stats(&b, roster.iter().map(|s| s.as_str()), "t1");
        assert_eq!(stats.total_students, 10);
        assert_eq!(stats.approved_students, 7);
        assert_eq!(stats.failed_students, 3);
        assert_eq!(stats.approval_percentage, 70.0);
        assert_eq!(stats.failure_percentage, 30.0);
    }

    #[test]
    fn approval_stats_on_empty_roster() {
        let b = book(Vec::new(), Vec::new());
        let stats = approval_stats(&b, std::iter::empty(), "t1");
        assert_eq!(stats.total_students, 0);
        assert_eq!(stats.approval_percentage, 0.0);
        assert_eq!(stats.failure_percentage, 0.0);
        assert!(stats.approval_percentage.is_finite());
    }

    #[test]
    fn recomputation_is_idempotent() {
        let b = book(
            vec![
                assignment("hw", ActivityKind::Homework),
                assignment("pa", ActivityKind::Partial),
            ],
            vec![
                entry("s1", "hw", Trimester::First, Some(3.3)),
                entry("s1", "pa", Trimester::First, Some(4.1)),
            ],
        );
        let first = trimester_average(&b, "s1", "t1", Trimester::First);
        let second = trimester_average(&b, "s1", "t1", Trimester::First);
        assert_eq!(first, second);
    }
}
