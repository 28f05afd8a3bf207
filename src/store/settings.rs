use chrono::Utc;
use rusqlite::params;

use super::Store;
use crate::error::AppResult;
use crate::models::{AgentConfig, ProxyConfig, RoutingStrategy};

impl Store {
    pub fn proxy_config(&self) -> AppResult<ProxyConfig> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT port, routing_strategy, api_key, auto_start FROM proxy_config WHERE id = 1",
            [],
            |row| {
                let strategy: String = row.get(1)?;
                Ok(ProxyConfig {
                    port: row.get::<_, i64>(0)? as u16,
                    routing_strategy: RoutingStrategy::parse(&strategy),
                    api_key: row.get(2)?,
                    auto_start: row.get(3)?,
                })
            },
        )
        .map_err(Into::into)
    }

    pub fn save_proxy_config(&self, config: &ProxyConfig) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE proxy_config SET port = ?1, routing_strategy = ?2, api_key = ?3,
                auto_start = ?4
             WHERE id = 1",
            params![
                config.port as i64,
                config.routing_strategy.as_str(),
                config.api_key,
                config.auto_start,
            ],
        )?;
        Ok(())
    }

    pub fn set_routing_strategy(&self, strategy: RoutingStrategy) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE proxy_config SET routing_strategy = ?1 WHERE id = 1",
            params![strategy.as_str()],
        )?;
        Ok(())
    }

    pub fn upsert_agent(&self, agent: &AgentConfig) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agent_config (
                agent_name, config_path, installed, auto_configured, proxy_url,
                last_configured
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(agent_name) DO UPDATE SET
                config_path = ?2,
                installed = ?3,
                auto_configured = ?4,
                proxy_url = ?5,
                last_configured = ?6",
            params![
                agent.agent_name,
                agent.config_path,
                agent.installed,
                agent.auto_configured,
                agent.proxy_url,
                agent.last_configured.or(Some(Utc::now().timestamp())),
            ],
        )?;
        Ok(())
    }

    pub fn list_agents(&self) -> AppResult<Vec<AgentConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT agent_name, config_path, installed, auto_configured, proxy_url,
                    last_configured
             FROM agent_config ORDER BY agent_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AgentConfig {
                agent_name: row.get(0)?,
                config_path: row.get(1)?,
                installed: row.get(2)?,
                auto_configured: row.get(3)?,
                proxy_url: row.get(4)?,
                last_configured: row.get(5)?,
            })
        })?;
        let mut agents = Vec::new();
        for agent in rows {
            agents.push(agent?);
        }
        Ok(agents)
    }
}
