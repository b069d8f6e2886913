//! Node-path expression parser.

use crate::PathError;

pub const SEPARATOR_CHILD: char = '/';
pub const SEPARATOR_ATTRIB: char = '.';
pub const SEPARATOR_DESCEND: char = '>';

/// Selection over multiple matches: a single position or a slice with
/// Python semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Index {
    Single(i64),
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
}

impl Index {
    /// The slice selecting everything.
    pub fn all() -> Self {
        Index::Slice {
            start: None,
            stop: None,
            step: None,
        }
    }

    /// Applies the selection to a list of matches.
    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let len = items.len() as i64;
        match self {
            Index::Single(i) => {
                let idx = if *i < 0 { len + i } else { *i };
                if (0..len).contains(&idx) {
                    vec![items[idx as usize].clone()]
                } else {
                    Vec::new()
                }
            }
            Index::Slice { start, stop, step } => {
                let step = step.unwrap_or(1);
                if step == 0 {
                    return Vec::new();
                }
                let clamp = |i: i64, upper: i64| -> i64 {
                    let i = if i < 0 { len + i } else { i };
                    i.clamp(if step < 0 { -1 } else { 0 }, upper)
                };
                let mut out = Vec::new();
                if step > 0 {
                    let from = start.map_or(0, |s| clamp(s, len));
                    let to = stop.map_or(len, |s| clamp(s, len));
                    let mut i = from;
                    while i < to {
                        out.push(items[i as usize].clone());
                        i += step;
                    }
                } else {
                    let from = start.map_or(len - 1, |s| clamp(s, len - 1));
                    let to = stop.map_or(-1, |s| clamp(s, len - 1));
                    let mut i = from;
                    while i > to {
                        out.push(items[i as usize].clone());
                        i += step;
                    }
                }
                out
            }
        }
    }
}

/// One component of a node path: how it relates to its predecessor, the
/// entity id to match and the selection over the matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathComponent {
    pub separator: char,
    pub id: String,
    pub index: Index,
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePath {
    pub subset_index: Index,
    pub components: Vec<PathComponent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    SubsetAt,
    SubsetSliceFirst,
    SubsetSliceRest,
    SubsetSliceDone,
    Id,
    SliceFirst,
    SliceRest,
    SliceDone,
}

/// Parser for path expressions.
///
/// With `bare_id_matches_all` (the default) a component without a slicing
/// part matches every occurrence; otherwise only the first.
pub struct NodePathParser {
    bare_id_matches_all: bool,
}

impl Default for NodePathParser {
    fn default() -> Self {
        Self::new()
    }
}

struct Parsing {
    state: State,
    token: String,
    separator: char,
    id: String,
    slice_elements: Vec<Option<i64>>,
    path: NodePath,
}

impl NodePathParser {
    pub fn new() -> Self {
        Self {
            bare_id_matches_all: true,
        }
    }

    pub fn first_match_only() -> Self {
        Self {
            bare_id_matches_all: false,
        }
    }

    pub fn parse(&self, path_expr: &str) -> Result<NodePath, PathError> {
        let stripped = path_expr.trim();
        let first = stripped.chars().next().ok_or(PathError::EmptyExpression)?;
        if !(first == '@'
            || first == SEPARATOR_CHILD
            || first == SEPARATOR_DESCEND
            || first.is_ascii_digit()
            || first.is_ascii_uppercase())
        {
            return Err(PathError::UnexpectedChar { c: first, pos: 0 });
        }

        let mut p = Parsing {
            state: State::Start,
            token: String::new(),
            separator: SEPARATOR_DESCEND,
            id: String::new(),
            slice_elements: Vec::new(),
            path: NodePath {
                subset_index: Index::all(),
                components: Vec::new(),
            },
        };

        for (pos, c) in path_expr.chars().enumerate() {
            match c {
                c if c.is_whitespace() => {}
                '@' => {
                    if p.state == State::Start {
                        p.state = State::SubsetAt;
                    } else {
                        return Err(PathError::UnexpectedChar { c, pos });
                    }
                }
                '[' => self.handle_left_bracket(&mut p, pos)?,
                ':' | ']' => self.handle_colon_and_right_bracket(&mut p, c, pos)?,
                SEPARATOR_CHILD | SEPARATOR_ATTRIB | SEPARATOR_DESCEND => {
                    self.handle_separator(&mut p, c, pos)?
                }
                _ => match p.state {
                    State::Id
                    | State::SubsetSliceFirst
                    | State::SubsetSliceRest
                    | State::SliceFirst
                    | State::SliceRest => p.token.push(c),
                    State::Start => {
                        self.handle_separator(&mut p, SEPARATOR_DESCEND, pos)?;
                        p.token.push(c);
                    }
                    _ => return Err(PathError::UnexpectedChar { c, pos }),
                },
            }
        }

        let end = path_expr.len();
        match p.state {
            State::Id => {
                p.id = Self::take_id(&mut p.token, end)?;
                self.push_component(&mut p)?;
            }
            State::SliceDone => self.push_component(&mut p)?,
            _ => {
                if let Some(c) = p.token.chars().next() {
                    return Err(PathError::UnexpectedChar {
                        c,
                        pos: end - p.token.len(),
                    });
                }
            }
        }

        Ok(p.path)
    }

    fn handle_left_bracket(&self, p: &mut Parsing, pos: usize) -> Result<(), PathError> {
        match p.state {
            State::SubsetAt => {
                p.state = State::SubsetSliceFirst;
                Ok(())
            }
            State::Id => {
                p.id = Self::take_id(&mut p.token, pos)?;
                p.state = State::SliceFirst;
                Ok(())
            }
            _ => Err(PathError::UnexpectedChar { c: '[', pos }),
        }
    }

    fn handle_colon_and_right_bracket(
        &self,
        p: &mut Parsing,
        c: char,
        pos: usize,
    ) -> Result<(), PathError> {
        if !matches!(
            p.state,
            State::SubsetSliceFirst | State::SubsetSliceRest | State::SliceFirst | State::SliceRest
        ) {
            return Err(PathError::UnexpectedChar { c, pos });
        }
        // An empty single index like `[]` has no meaning.
        if c == ']'
            && p.token.is_empty()
            && matches!(p.state, State::SubsetSliceFirst | State::SliceFirst)
        {
            return Err(PathError::UnexpectedChar { c, pos });
        }
        let element = if p.token.is_empty() {
            None
        } else {
            let parsed = p.token.parse::<i64>().map_err(|_| PathError::InvalidSlice {
                token: p.token.clone(),
                pos,
            })?;
            Some(parsed)
        };
        p.token.clear();
        p.slice_elements.push(element);

        p.state = match (c, p.state) {
            (':', State::SubsetSliceFirst) => State::SubsetSliceRest,
            (':', State::SliceFirst) => State::SliceRest,
            (':', other) => other,
            (_, State::SubsetSliceFirst | State::SubsetSliceRest) => State::SubsetSliceDone,
            (_, _) => State::SliceDone,
        };
        Ok(())
    }

    fn handle_separator(&self, p: &mut Parsing, c: char, pos: usize) -> Result<(), PathError> {
        match p.state {
            State::Start if c != SEPARATOR_ATTRIB => {
                p.path.subset_index = self.create_index(&mut p.slice_elements)?;
            }
            State::Id => {
                p.id = Self::take_id(&mut p.token, pos)?;
                self.push_component(p)?;
            }
            State::SubsetSliceDone => {
                if c == SEPARATOR_ATTRIB {
                    return Err(PathError::UnexpectedChar { c, pos });
                }
                p.path.subset_index = self.create_index(&mut p.slice_elements)?;
            }
            State::SliceDone => self.push_component(p)?,
            _ => return Err(PathError::UnexpectedChar { c, pos }),
        }
        p.separator = c;
        p.state = State::Id;
        Ok(())
    }

    fn take_id(token: &mut String, pos: usize) -> Result<String, PathError> {
        if token.is_empty() {
            return Err(PathError::EmptyId { pos });
        }
        Ok(std::mem::take(token))
    }

    fn create_index(&self, elements: &mut Vec<Option<i64>>) -> Result<Index, PathError> {
        let index = match elements.len() {
            0 => {
                if self.bare_id_matches_all {
                    Index::all()
                } else {
                    Index::Single(0)
                }
            }
            1 => match elements[0] {
                // A lone negative index behaves as a one-element slice so
                // out-of-range selections stay empty instead of wrapping.
                Some(i) if i >= 0 => Index::Single(i),
                Some(i) => Index::Slice {
                    start: Some(i),
                    stop: if i == -1 { None } else { Some(i + 1) },
                    step: None,
                },
                None => Index::all(),
            },
            2 | 3 => Index::Slice {
                start: elements[0],
                stop: elements[1],
                step: elements.get(2).copied().flatten(),
            },
            _ => return Err(PathError::TooManyIndices),
        };
        elements.clear();
        Ok(index)
    }

    fn push_component(&self, p: &mut Parsing) -> Result<(), PathError> {
        let index = self.create_index(&mut p.slice_elements)?;
        p.path.components.push(PathComponent {
            separator: p.separator,
            id: std::mem::take(&mut p.id),
            index,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(expr: &str) -> NodePath {
        NodePathParser::new().parse(expr).unwrap()
    }

    #[test]
    fn test_child_components() {
        let path = parse("/301001/001001");
        assert_eq!(path.subset_index, Index::all());
        assert_eq!(path.components.len(), 2);
        assert_eq!(path.components[0].separator, SEPARATOR_CHILD);
        assert_eq!(path.components[0].id, "301001");
        assert_eq!(path.components[1].id, "001001");
    }

    #[test]
    fn test_bare_id_descends() {
        let path = parse("012001");
        assert_eq!(path.components.len(), 1);
        assert_eq!(path.components[0].separator, SEPARATOR_DESCEND);
        assert_eq!(path.components[0].index, Index::all());
    }

    #[test]
    fn test_subset_and_slices() {
        let path = parse("@[0] > 012001[1:3]");
        assert_eq!(path.subset_index, Index::Single(0));
        assert_eq!(
            path.components[0].index,
            Index::Slice {
                start: Some(1),
                stop: Some(3),
                step: None
            }
        );
    }

    #[test]
    fn test_attribute_component() {
        let path = parse("012001.A12001");
        assert_eq!(path.components[1].separator, SEPARATOR_ATTRIB);
        assert_eq!(path.components[1].id, "A12001");
    }

    #[test]
    fn test_negative_single_index() {
        let path = parse("012001[-1]");
        assert_eq!(
            path.components[0].index,
            Index::Slice {
                start: Some(-1),
                stop: None,
                step: None
            }
        );
    }

    #[test]
    fn test_errors() {
        let parser = NodePathParser::new();
        assert_eq!(parser.parse("   "), Err(PathError::EmptyExpression));
        assert!(matches!(
            parser.parse("!bad"),
            Err(PathError::UnexpectedChar { c: '!', pos: 0 })
        ));
        assert!(matches!(
            parser.parse("012001[]"),
            Err(PathError::UnexpectedChar { c: ']', .. })
        ));
        assert!(matches!(
            parser.parse("012001[a]"),
            Err(PathError::InvalidSlice { .. })
        ));
        assert!(matches!(
            parser.parse("@[0]._x"),
            Err(PathError::UnexpectedChar { .. })
        ));
    }

    #[test]
    fn test_index_apply_python_semantics() {
        let items: Vec<i32> = (0..5).collect();
        assert_eq!(Index::Single(1).apply(&items), vec![1]);
        assert_eq!(Index::Single(7).apply(&items), Vec::<i32>::new());
        assert_eq!(Index::all().apply(&items), items);
        let tail = Index::Slice {
            start: Some(-2),
            stop: None,
            step: None,
        };
        assert_eq!(tail.apply(&items), vec![3, 4]);
        let every_other = Index::Slice {
            start: None,
            stop: None,
            step: Some(2),
        };
        assert_eq!(every_other.apply(&items), vec![0, 2, 4]);
        let reversed = Index::Slice {
            start: None,
            stop: None,
            step: Some(-1),
        };
        assert_eq!(reversed.apply(&items), vec![4, 3, 2, 1, 0]);
    }
}
