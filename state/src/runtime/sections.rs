use super::*;
use crate::model::Section;
use crate::model::SectionCreateParams;
use crate::model::SectionRow;
use std::collections::HashMap;
use std::collections::HashSet;

impl ProjectStore {
    pub async fn create_section(&self, params: &SectionCreateParams) -> anyhow::Result<Section> {
        sqlx::query(
            r#"
INSERT INTO sections (id, name, position, priority, skipped, created_at)
VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(params.id.as_str())
        .bind(params.name.as_str())
        .bind(params.position)
        .bind(params.priority)
        .bind(now_seconds())
        .execute(self.pool.as_ref())
        .await?;
        let section_id = params.id.as_str();
        self.get_section(section_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created section {section_id}"))
    }

    pub async fn get_section(&self, section_id: &str) -> anyhow::Result<Option<Section>> {
        let row = sqlx::query_as::<_, SectionRow>(
            "SELECT id, name, position, priority, skipped, created_at FROM sections WHERE id = ?",
        )
        .bind(section_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(Section::try_from).transpose()
    }

    /// All sections in catalog order (position ascending).
    pub async fn list_sections(&self) -> anyhow::Result<Vec<Section>> {
        let rows = sqlx::query_as::<_, SectionRow>(
            r#"
SELECT id, name, position, priority, skipped, created_at
FROM sections
ORDER BY position ASC, id ASC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(Section::try_from).collect()
    }

    pub async fn set_section_skipped(
        &self,
        section_id: &str,
        skipped: bool,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query("UPDATE sections SET skipped = ? WHERE id = ?")
            .bind(i64::from(skipped))
            .bind(section_id)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    /// Declare `section_id` depends on `depends_on`. The store has no cycle
    /// constraint, so the adjacency list is walked here before inserting.
    pub async fn add_section_dependency(
        &self,
        section_id: &str,
        depends_on: &str,
    ) -> anyhow::Result<()> {
        if section_id == depends_on {
            anyhow::bail!("section {section_id} cannot depend on itself");
        }
        let edges = self.section_dependencies().await?;
        if creates_cycle(&edges, section_id, depends_on) {
            anyhow::bail!(
                "dependency {section_id} -> {depends_on} would create a cycle"
            );
        }
        sqlx::query(
            r#"
INSERT INTO section_dependencies (section_id, depends_on_section_id)
VALUES (?, ?)
ON CONFLICT(section_id, depends_on_section_id) DO NOTHING
            "#,
        )
        .bind(section_id)
        .bind(depends_on)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// Directed edges as (section, depends_on) pairs.
    pub async fn section_dependencies(&self) -> anyhow::Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT section_id, depends_on_section_id FROM section_dependencies ORDER BY id ASC",
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get("section_id")?,
                    row.try_get("depends_on_section_id")?,
                ))
            })
            .collect()
    }
}

/// Would adding `from -> to` close a cycle? Walks existing edges from `to`.
fn creates_cycle(edges: &[(String, String)], from: &str, to: &str) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (section, depends_on) in edges {
        adjacency
            .entry(section.as_str())
            .or_default()
            .push(depends_on.as_str());
    }
    let mut stack = vec![to];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == from {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = adjacency.get(node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn detects_transitive_cycles() {
        let edges = vec![edge("b", "c"), edge("c", "d")];
        assert!(creates_cycle(&edges, "d", "b"));
        assert!(!creates_cycle(&edges, "a", "d"));
    }

    #[test]
    fn direct_back_edge_is_a_cycle() {
        let edges = vec![edge("a", "b")];
        assert!(creates_cycle(&edges, "b", "a"));
    }
}
