use std::collections::HashMap;

use anyhow::Result;

use crate::common::RouterError;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// 检查代理组成员图无环
///
/// `groups` 为 组名 -> 成员名；不在表中的名字视为叶子（代理或保留字）。
/// 组名按字典序遍历，同一配置总是报告同一条环路。
pub fn validate_cycles(groups: &HashMap<String, Vec<String>>) -> Result<()> {
    let mut names: Vec<&str> = groups.keys().map(String::as_str).collect();
    names.sort_unstable();

    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(groups.len());
    let mut path: Vec<&str> = Vec::new();

    for name in names {
        if !marks.contains_key(name) {
            if let Some(cycle) = dfs(name, groups, &mut marks, &mut path) {
                return Err(RouterError::Cycle(cycle).into());
            }
        }
    }
    Ok(())
}

fn dfs<'a>(
    current: &'a str,
    groups: &'a HashMap<String, Vec<String>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    let Some(members) = groups.get(current) else {
        marks.insert(current, Mark::Done);
        return None;
    };

    marks.insert(current, Mark::Visiting);
    path.push(current);

    for child in members {
        match marks.get(child.as_str()) {
            Some(Mark::Visiting) => {
                // 从 child 首次出现处截取，闭合成环
                let start = path.iter().position(|n| *n == child.as_str()).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(child.clone());
                return Some(cycle);
            }
            Some(Mark::Done) => {}
            None => {
                if let Some(cycle) = dfs(child, groups, marks, path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    marks.insert(current, Mark::Done);
    None
}
