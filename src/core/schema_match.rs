// スキーマ構造比較
//
// 2つのDatabase値が同期可能な構造を持つかを判定する純粋アルゴリズム。
// ソート済み列のマージジョイン走査で、辞書順で最初の不一致を検出した
// 時点で比較全体を打ち切ります。複数エラーの集約や部分的な成功は
// ありません。入力はどちらも変更されません。

use std::cmp::Ordering;

use crate::core::config::TableFilters;
use crate::core::error::SchemaMismatch;
use crate::core::schema::{Column, Database, Key, PrimaryKeyType, Table};

/// 2つのスキーマが構造的に一致するか検査する
///
/// `from` は同期元（ピアから受信したスキーマ）、`to` は同期先
/// （ローカルのスキーマ）。フィルターは両側に同一に適用され、
/// `ignore` に含まれるテーブルと、`only` が非空のときそこに含まれない
/// テーブルは比較から除外されます。
///
/// 最初の不一致を `SchemaMismatch` として返します。
pub fn check_schema_match(
    from: &Database,
    to: &Database,
    filters: &TableFilters,
) -> Result<(), SchemaMismatch> {
    // データベースは通常ソート済みでテーブルを返すが、アルゴリズムが
    // それを要求するため、ここで防御的にソートし直す
    let from_tables = sorted_in_scope_tables(from, filters);
    let to_tables = sorted_in_scope_tables(to, filters);

    diff_sorted_by_name(
        &from_tables,
        &to_tables,
        |table| &table.name,
        |name| format!("Missing table {}", name),
        |name| format!("Extra table {}", name),
        check_table_match,
    )
}

fn sorted_in_scope_tables<'a>(database: &'a Database, filters: &TableFilters) -> Vec<&'a Table> {
    let mut tables: Vec<&Table> = database
        .tables
        .iter()
        .filter(|table| !filters.excludes(&table.name))
        .collect();
    tables.sort_by(|a, b| a.name.cmp(&b.name));
    tables
}

/// 名前順にソートされた2列のマージジョイン差分
///
/// 2つのカーソルを並行して進め、`from` 側の名前が小さければ
/// Missing、`to` 側が小さければ Extra、等しければ詳細比較に再帰して
/// 両方を進めます。ソート済み入力に対して単一パスのO(n)で、常に
/// 辞書順で最初の不一致を報告します。テーブル列とキー列の両方で
/// 使用されます。
fn diff_sorted_by_name<'a, T, N, M, X, C>(
    from: &[&'a T],
    to: &[&'a T],
    name_of: N,
    missing: M,
    extra: X,
    mut check: C,
) -> Result<(), SchemaMismatch>
where
    N: Fn(&T) -> &str,
    M: Fn(&str) -> String,
    X: Fn(&str) -> String,
    C: FnMut(&T, &T) -> Result<(), SchemaMismatch>,
{
    let mut to_iter = to.iter();
    let mut to_item = to_iter.next();

    for from_item in from {
        match to_item {
            None => return Err(SchemaMismatch::new(missing(name_of(from_item)))),
            Some(current) => match name_of(current).cmp(name_of(from_item)) {
                Ordering::Greater => {
                    return Err(SchemaMismatch::new(missing(name_of(from_item))));
                }
                Ordering::Less => {
                    return Err(SchemaMismatch::new(extra(name_of(current))));
                }
                Ordering::Equal => {
                    check(from_item, current)?;
                    to_item = to_iter.next();
                }
            },
        }
    }

    match to_item {
        Some(current) => Err(SchemaMismatch::new(extra(name_of(current)))),
        None => Ok(()),
    }
}

fn check_table_match(from_table: &Table, to_table: &Table) -> Result<(), SchemaMismatch> {
    check_columns_match(from_table, &from_table.columns, &to_table.columns)?;
    check_primary_key_match(from_table, to_table)?;
    check_keys_match(from_table, &from_table.keys, &to_table.keys)
}

/// カラム列の位置比較
///
/// カラムの宣言順は移植可能なスキーマ事実なので、マージジョインでは
/// なく位置で厳密に比較します。名前の不一致は、次に期待される名前が
/// 分かる形で Missing/Extra/Misordered として報告します。
fn check_columns_match(
    table: &Table,
    from_columns: &[Column],
    to_columns: &[Column],
) -> Result<(), SchemaMismatch> {
    let mut to_position = 0;

    for (from_position, from_column) in from_columns.iter().enumerate() {
        if to_position < to_columns.len() && to_columns[to_position].name == from_column.name {
            // FUTURE: カラム型や照合順序の詳細比較
            to_position += 1;
        } else if !to_columns[to_position..]
            .iter()
            .any(|column| column.name == from_column.name)
        {
            return Err(SchemaMismatch::new(format!(
                "Missing column {} on table {}",
                from_column.name, table.name
            )));
        } else if !from_columns[from_position..]
            .iter()
            .any(|column| column.name == to_columns[to_position].name)
        {
            return Err(SchemaMismatch::new(format!(
                "Extra column {} on table {}",
                to_columns[to_position].name, table.name
            )));
        } else {
            return Err(SchemaMismatch::new(format!(
                "Misordered column {} on table {}, should have {} first",
                from_column.name, table.name, to_columns[to_position].name
            )));
        }
    }

    if to_position < to_columns.len() {
        return Err(SchemaMismatch::new(format!(
            "Extra column {} on table {}",
            to_columns[to_position].name, table.name
        )));
    }

    Ok(())
}

/// プライマリキーの比較
///
/// 明示的なプライマリキーを持つ側のカラムだけが等価性に寄与します。
/// 代替ユニークキー（surrogate）はローカルな便宜であって移植可能な
/// スキーマ事実ではないため、「なし」と同等に扱います。両側が明示的な
/// 場合のみ、インデックス列が順序まで一致することを要求します。
fn check_primary_key_match(from_table: &Table, to_table: &Table) -> Result<(), SchemaMismatch> {
    let both_explicit = from_table.primary_key_type == PrimaryKeyType::ExplicitPrimaryKey
        && to_table.primary_key_type == PrimaryKeyType::ExplicitPrimaryKey;

    if both_explicit && from_table.primary_key_columns != to_table.primary_key_columns {
        return Err(SchemaMismatch::new(format!(
            "Mismatching primary key {} on table {}, should have {}",
            columns_list(&to_table.columns, &to_table.primary_key_columns),
            from_table.name,
            columns_list(&from_table.columns, &from_table.primary_key_columns)
        )));
    }

    Ok(())
}

fn check_keys_match(
    table: &Table,
    from_keys: &[Key],
    to_keys: &[Key],
) -> Result<(), SchemaMismatch> {
    // キーは既に一貫した順序で渡されるはずだが、アルゴリズムが
    // ソート済みであることを要求するため、ここで強制する
    let from_keys = sorted_keys(from_keys);
    let to_keys = sorted_keys(to_keys);

    diff_sorted_by_name(
        &from_keys,
        &to_keys,
        |key| &key.name,
        |name| format!("Missing key {} on table {}", name, table.name),
        |name| format!("Extra key {} on table {}", name, table.name),
        |from_key, to_key| check_key_match(table, from_key, to_key),
    )
}

fn sorted_keys(keys: &[Key]) -> Vec<&Key> {
    let mut keys: Vec<&Key> = keys.iter().collect();
    keys.sort();
    keys
}

fn check_key_match(table: &Table, from_key: &Key, to_key: &Key) -> Result<(), SchemaMismatch> {
    if from_key.key_type != to_key.key_type {
        if from_key.unique() != to_key.unique() {
            return Err(SchemaMismatch::new(format!(
                "Mismatching unique flag on table {} key {}",
                table.name, from_key.name
            )));
        }
        return Err(SchemaMismatch::new(format!(
            "Mismatching spatial flag on table {} key {}",
            table.name, from_key.name
        )));
    }

    if from_key.columns != to_key.columns {
        return Err(SchemaMismatch::new(format!(
            "Mismatching columns {} on table {} key {}, should have {}",
            columns_list(&table.columns, &to_key.columns),
            table.name,
            from_key.name,
            columns_list(&table.columns, &from_key.columns)
        )));
    }

    Ok(())
}

/// カラムインデックス列を診断メッセージ用の名前リストにする
///
/// 範囲外のインデックスはそのまま数値で表示します（診断の途中で
/// さらに失敗しないように）。
fn columns_list(columns: &[Column], indices: &[usize]) -> String {
    let names: Vec<String> = indices
        .iter()
        .map(|&index| match columns.get(index) {
            Some(column) => column.name.clone(),
            None => format!("#{}", index),
        })
        .collect();
    format!("({})", names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{ColumnType, KeyType};

    fn column(name: &str) -> Column {
        Column::new(name, ColumnType::INT, false)
    }

    fn table_with_columns(name: &str, column_names: &[&str]) -> Table {
        let mut table = Table::new(name);
        for column_name in column_names {
            table.columns.push(column(column_name));
        }
        table
    }

    fn database_of(tables: Vec<Table>) -> Database {
        Database { tables }
    }

    fn no_filters() -> TableFilters {
        TableFilters::default()
    }

    #[test]
    fn test_identical_schemas_match() {
        let from = database_of(vec![table_with_columns("users", &["id", "name"])]);
        let to = from.clone();
        assert!(check_schema_match(&from, &to, &no_filters()).is_ok());
    }

    #[test]
    fn test_missing_table_reported_lexicographically_first() {
        let from = database_of(vec![
            table_with_columns("a", &["id"]),
            table_with_columns("b", &["id"]),
            table_with_columns("c", &["id"]),
        ]);
        let to = database_of(vec![
            table_with_columns("a", &["id"]),
            table_with_columns("c", &["id"]),
        ]);

        let error = check_schema_match(&from, &to, &no_filters()).unwrap_err();
        assert_eq!(error.message, "Missing table b");
    }

    #[test]
    fn test_extra_table_reported() {
        let from = database_of(vec![table_with_columns("a", &["id"])]);
        let to = database_of(vec![
            table_with_columns("a", &["id"]),
            table_with_columns("z", &["id"]),
        ]);

        let error = check_schema_match(&from, &to, &no_filters()).unwrap_err();
        assert_eq!(error.message, "Extra table z");
    }

    #[test]
    fn test_unsorted_input_is_sorted_defensively() {
        let from = database_of(vec![
            table_with_columns("b", &["id"]),
            table_with_columns("a", &["id"]),
        ]);
        let to = database_of(vec![
            table_with_columns("a", &["id"]),
            table_with_columns("b", &["id"]),
        ]);
        assert!(check_schema_match(&from, &to, &no_filters()).is_ok());
    }

    #[test]
    fn test_misordered_columns() {
        let from = database_of(vec![table_with_columns("t", &["a", "b", "c"])]);
        let to = database_of(vec![table_with_columns("t", &["a", "c", "b"])]);

        let error = check_schema_match(&from, &to, &no_filters()).unwrap_err();
        assert_eq!(
            error.message,
            "Misordered column b on table t, should have c first"
        );
    }

    #[test]
    fn test_missing_column() {
        let from = database_of(vec![table_with_columns("t", &["a", "b"])]);
        let to = database_of(vec![table_with_columns("t", &["a"])]);

        let error = check_schema_match(&from, &to, &no_filters()).unwrap_err();
        assert_eq!(error.message, "Missing column b on table t");
    }

    #[test]
    fn test_extra_trailing_column() {
        let from = database_of(vec![table_with_columns("t", &["a"])]);
        let to = database_of(vec![table_with_columns("t", &["a", "b"])]);

        let error = check_schema_match(&from, &to, &no_filters()).unwrap_err();
        assert_eq!(error.message, "Extra column b on table t");
    }

    #[test]
    fn test_explicit_vs_surrogate_primary_key_is_not_a_mismatch() {
        let mut from_table = table_with_columns("t", &["id"]);
        from_table.primary_key_columns = vec![0];
        from_table.primary_key_type = PrimaryKeyType::ExplicitPrimaryKey;

        let mut to_table = table_with_columns("t", &["id"]);
        to_table.primary_key_columns = vec![0];
        to_table.primary_key_type = PrimaryKeyType::SuitableUniqueKey;

        let from = database_of(vec![from_table]);
        let to = database_of(vec![to_table]);
        assert!(check_schema_match(&from, &to, &no_filters()).is_ok());
    }

    #[test]
    fn test_both_explicit_primary_keys_must_agree() {
        let mut from_table = table_with_columns("t", &["id", "tenant_id"]);
        from_table.primary_key_columns = vec![0];
        from_table.primary_key_type = PrimaryKeyType::ExplicitPrimaryKey;

        let mut to_table = table_with_columns("t", &["id", "tenant_id"]);
        to_table.primary_key_columns = vec![1, 0];
        to_table.primary_key_type = PrimaryKeyType::ExplicitPrimaryKey;

        let from = database_of(vec![from_table]);
        let to = database_of(vec![to_table]);

        let error = check_schema_match(&from, &to, &no_filters()).unwrap_err();
        assert_eq!(
            error.message,
            "Mismatching primary key (tenant_id, id) on table t, should have (id)"
        );
    }

    #[test]
    fn test_unique_flag_mismatch() {
        let mut from_table = table_with_columns("orders", &["id", "email"]);
        let mut key = Key::new("idx_email", KeyType::UniqueKey);
        key.columns = vec![1];
        from_table.keys.push(key);

        let mut to_table = table_with_columns("orders", &["id", "email"]);
        let mut key = Key::new("idx_email", KeyType::StandardKey);
        key.columns = vec![1];
        to_table.keys.push(key);

        let from = database_of(vec![from_table]);
        let to = database_of(vec![to_table]);

        let error = check_schema_match(&from, &to, &no_filters()).unwrap_err();
        assert_eq!(
            error.message,
            "Mismatching unique flag on table orders key idx_email"
        );
    }

    #[test]
    fn test_key_column_order_mismatch() {
        let mut from_table = table_with_columns("t", &["a", "b"]);
        let mut key = Key::new("idx", KeyType::StandardKey);
        key.columns = vec![0, 1];
        from_table.keys.push(key);

        let mut to_table = table_with_columns("t", &["a", "b"]);
        let mut key = Key::new("idx", KeyType::StandardKey);
        key.columns = vec![1, 0];
        to_table.keys.push(key);

        let from = database_of(vec![from_table]);
        let to = database_of(vec![to_table]);

        let error = check_schema_match(&from, &to, &no_filters()).unwrap_err();
        assert_eq!(
            error.message,
            "Mismatching columns (b, a) on table t key idx, should have (a, b)"
        );
    }

    #[test]
    fn test_missing_and_extra_keys() {
        let mut from_table = table_with_columns("t", &["a"]);
        from_table.keys.push(Key::new("idx_a", KeyType::StandardKey));

        let to_table = table_with_columns("t", &["a"]);

        let from = database_of(vec![from_table.clone()]);
        let to = database_of(vec![to_table.clone()]);
        let error = check_schema_match(&from, &to, &no_filters()).unwrap_err();
        assert_eq!(error.message, "Missing key idx_a on table t");

        let reversed = check_schema_match(&to, &from, &no_filters()).unwrap_err();
        assert_eq!(reversed.message, "Extra key idx_a on table t");
    }

    #[test]
    fn test_ignored_tables_are_skipped_on_both_sides() {
        let from = database_of(vec![
            table_with_columns("a", &["id"]),
            table_with_columns("staging", &["x", "y"]),
        ]);
        let to = database_of(vec![table_with_columns("a", &["id"])]);

        let mut filters = TableFilters::default();
        filters.ignore_tables.insert("staging".to_string());
        assert!(check_schema_match(&from, &to, &filters).is_ok());
    }

    #[test]
    fn test_only_filter_excludes_other_tables() {
        let from = database_of(vec![
            table_with_columns("a", &["id"]),
            table_with_columns("b", &["id"]),
        ]);
        let to = database_of(vec![table_with_columns("a", &["id"])]);

        let mut filters = TableFilters::default();
        filters.only_tables.insert("a".to_string());
        assert!(check_schema_match(&from, &to, &filters).is_ok());

        // bはonlyに含まれないので、どちら側の診断にも現れない
        filters.only_tables.insert("b".to_string());
        let error = check_schema_match(&from, &to, &filters).unwrap_err();
        assert_eq!(error.message, "Missing table b");
    }

    #[test]
    fn test_match_is_idempotent_and_read_only() {
        let mut from_table = table_with_columns("t", &["a", "b"]);
        let mut key = Key::new("idx", KeyType::UniqueKey);
        key.columns = vec![0];
        from_table.keys.push(Key::new("z_idx", KeyType::StandardKey));
        from_table.keys.push(key);

        let from = database_of(vec![from_table]);
        let to = from.clone();

        let from_before = from.clone();
        let to_before = to.clone();

        let first = check_schema_match(&from, &to, &no_filters());
        let second = check_schema_match(&from, &to, &no_filters());
        assert!(first.is_ok());
        assert!(second.is_ok());

        assert_eq!(from, from_before);
        assert_eq!(to, to_before);
    }
}
